//! Row encoder
//!
//! Pure functions turning one [`Entry`] into spool rows, one per target
//! table, in the PostgreSQL COPY text format: tab separated, no quoting,
//! `\N` for null, and `\t` / `\n` / `\r` / `\\` escapes inside fields.
//! Row order for a given entry is deterministic and follows the catalog.

use std::borrow::Cow;
use std::collections::HashSet;

use crate::model::{Entry, Profile, XmlNode};
use crate::schema;

/// COPY text-format null.
pub const NULL_FIELD: &str = "\\N";

/// Comment types retained by the `standard` profile.
const STANDARD_COMMENT_TYPES: &[&str] = &["function", "disease", "subcellular location"];

/// All spool rows produced from a single entry. The coordinator writes a
/// batch as one unit so an entry never appears partially loaded.
#[derive(Debug, Clone, Default)]
pub struct EntryRows {
    /// `(table name, encoded line without trailing newline)` pairs.
    pub rows: Vec<(&'static str, String)>,
}

/// Escape a field value for the COPY text format.
pub fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['\t', '\n', '\r', '\\']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

fn text_field(value: Option<&str>) -> String {
    match value {
        Some(v) => escape(v).into_owned(),
        None => NULL_FIELD.to_string(),
    }
}

fn num_field<N: ToString>(value: Option<N>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => NULL_FIELD.to_string(),
    }
}

fn date_field(value: Option<chrono::NaiveDate>) -> String {
    match value {
        Some(d) => d.format("%Y-%m-%d").to_string(),
        None => NULL_FIELD.to_string(),
    }
}

fn bool_field(value: bool) -> &'static str {
    if value {
        "t"
    } else {
        "f"
    }
}

/// Serialize a list of XML nodes as a single-line JSON array; an empty
/// list encodes as null, matching a column that was never populated.
fn json_field(nodes: &[XmlNode]) -> String {
    if nodes.is_empty() {
        return NULL_FIELD.to_string();
    }
    let json = serde_json::to_string(nodes).expect("xml node serialization cannot fail");
    escape(&json).into_owned()
}

fn comments_for_profile(entry: &Entry, profile: Profile) -> Vec<XmlNode> {
    match profile {
        Profile::Full => entry.comments.clone(),
        Profile::Standard => entry
            .comments
            .iter()
            .filter(|c| {
                c.attr("type")
                    .is_some_and(|t| STANDARD_COMMENT_TYPES.contains(&t))
            })
            .cloned()
            .collect(),
    }
}

/// Encode one entry into its spool rows under the given profile.
pub fn encode_entry(entry: &Entry, profile: Profile) -> EntryRows {
    let accession = entry.primary_accession.as_str();
    let mut out = EntryRows::default();

    if let Some(taxid) = entry.ncbi_taxid {
        out.rows.push((
            schema::TAXONOMY,
            [
                taxid.to_string(),
                text_field(entry.organism_scientific_name.as_deref()),
                text_field(entry.organism_lineage.as_deref()),
            ]
            .join("\t"),
        ));
    }

    let comments = comments_for_profile(entry, profile);
    let (features, db_references, evidence): (&[XmlNode], &[XmlNode], &[XmlNode]) = match profile {
        Profile::Full => (&entry.features, &entry.db_references, &entry.evidence),
        Profile::Standard => (&[], &[], &[]),
    };
    out.rows.push((
        schema::PROTEINS,
        [
            escape(accession).into_owned(),
            text_field(entry.uniprot_id.as_deref()),
            text_field(entry.protein_name.as_deref()),
            num_field(entry.ncbi_taxid),
            num_field(entry.sequence_length),
            num_field(entry.molecular_weight),
            date_field(entry.created_date),
            date_field(entry.modified_date),
            json_field(&comments),
            json_field(features),
            json_field(db_references),
            json_field(evidence),
        ]
        .join("\t"),
    ));

    out.rows.push((
        schema::SEQUENCES,
        [
            escape(accession).into_owned(),
            text_field(entry.sequence.as_deref()),
        ]
        .join("\t"),
    ));

    let mut seen_secondary = HashSet::new();
    for secondary in &entry.secondary_accessions {
        if secondary == accession || !seen_secondary.insert(secondary.as_str()) {
            continue;
        }
        out.rows.push((
            schema::ACCESSIONS,
            [escape(accession).into_owned(), escape(secondary).into_owned()].join("\t"),
        ));
    }

    let mut seen_genes = HashSet::new();
    for gene in &entry.genes {
        if !seen_genes.insert(gene.name.as_str()) {
            continue;
        }
        out.rows.push((
            schema::GENES,
            [
                escape(accession).into_owned(),
                escape(&gene.name).into_owned(),
                bool_field(gene.is_primary).to_string(),
            ]
            .join("\t"),
        ));
    }

    let mut seen_keywords = HashSet::new();
    for keyword in &entry.keywords {
        if !seen_keywords.insert(keyword.id.as_str()) {
            continue;
        }
        out.rows.push((
            schema::KEYWORDS,
            [
                escape(accession).into_owned(),
                escape(&keyword.id).into_owned(),
                escape(&keyword.label).into_owned(),
            ]
            .join("\t"),
        ));
    }

    let mut seen_go = HashSet::new();
    for go_term in &entry.go_terms {
        if !seen_go.insert(go_term.as_str()) {
            continue;
        }
        out.rows.push((
            schema::PROTEIN_TO_GO,
            [escape(accession).into_owned(), escape(go_term).into_owned()].join("\t"),
        ));
    }

    if let Some(taxid) = entry.ncbi_taxid {
        out.rows.push((
            schema::PROTEIN_TO_TAXONOMY,
            [escape(accession).into_owned(), taxid.to_string()].join("\t"),
        ));
    }

    out
}
