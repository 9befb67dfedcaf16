//! In-memory records produced by the XML parser and consumed by the
//! row encoder.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::EtlError;

/// How much semi-structured data is retained per protein.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Keep only `function`, `disease` and `subcellular location` comments;
    /// features, cross-references and evidence are stored as null.
    #[default]
    Standard,
    /// Keep all four JSON payload columns.
    Full,
}

impl FromStr for Profile {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Profile::Standard),
            "full" => Ok(Profile::Full),
            other => Err(EtlError::Config(format!(
                "unknown profile '{other}' (expected 'standard' or 'full')"
            ))),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Standard => write!(f, "standard"),
            Profile::Full => write!(f, "full"),
        }
    }
}

/// Load strategy selected per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Rebuild into staging and atomically rename over production.
    Full,
    /// Merge staging into production via upserts and set replacement.
    Delta,
}

impl FromStr for LoadMode {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(LoadMode::Full),
            "delta" => Ok(LoadMode::Delta),
            other => Err(EtlError::Config(format!(
                "unknown load mode '{other}' (expected 'full' or 'delta')"
            ))),
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Full => write!(f, "full"),
            LoadMode::Delta => write!(f, "delta"),
        }
    }
}

/// UniProtKB source dataset selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Swissprot,
    Trembl,
    All,
}

impl Dataset {
    /// File name of the compressed XML corpus on the UniProt mirror.
    ///
    /// `All` expands to both concrete datasets before this is called.
    pub fn file_name(&self) -> &'static str {
        match self {
            Dataset::Swissprot => "uniprot_sprot.xml.gz",
            Dataset::Trembl => "uniprot_trembl.xml.gz",
            Dataset::All => unreachable!("'all' must be expanded before file resolution"),
        }
    }

    /// Concrete datasets this selection covers.
    pub fn expand(&self) -> Vec<Dataset> {
        match self {
            Dataset::All => vec![Dataset::Swissprot, Dataset::Trembl],
            other => vec![*other],
        }
    }
}

impl FromStr for Dataset {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swissprot" => Ok(Dataset::Swissprot),
            "trembl" => Ok(Dataset::Trembl),
            "all" => Ok(Dataset::All),
            other => Err(EtlError::Config(format!(
                "unknown dataset '{other}' (expected 'swissprot', 'trembl' or 'all')"
            ))),
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Swissprot => write!(f, "swissprot"),
            Dataset::Trembl => write!(f, "trembl"),
            Dataset::All => write!(f, "all"),
        }
    }
}

/// An XML element reduced to tag, attributes, children and text.
///
/// This is the shape stored in the JSON payload columns. A `BTreeMap`
/// keeps attribute serialization order stable across runs, which in turn
/// keeps full loads byte-identical for identical inputs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XmlNode {
    pub tag: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<XmlNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl XmlNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// First direct child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// All direct children with the given tag, in document order.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A gene name attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gene {
    pub name: String,
    pub is_primary: bool,
}

/// A controlled-vocabulary keyword attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyword {
    pub id: String,
    pub label: String,
}

/// One UniProtKB protein record, extracted from a single `<entry>`
/// element. Optional fields are absent in the source XML, not parse
/// failures.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entry {
    pub primary_accession: String,
    pub secondary_accessions: Vec<String>,
    pub uniprot_id: Option<String>,
    pub protein_name: Option<String>,
    pub ncbi_taxid: Option<i64>,
    pub organism_scientific_name: Option<String>,
    pub organism_lineage: Option<String>,
    pub sequence_length: Option<i32>,
    pub molecular_weight: Option<i32>,
    pub sequence: Option<String>,
    pub created_date: Option<NaiveDate>,
    pub modified_date: Option<NaiveDate>,
    pub genes: Vec<Gene>,
    pub keywords: Vec<Keyword>,
    pub go_terms: Vec<String>,
    pub comments: Vec<XmlNode>,
    pub features: Vec<XmlNode>,
    pub db_references: Vec<XmlNode>,
    pub evidence: Vec<XmlNode>,
}
