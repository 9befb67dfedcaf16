//! Streaming XML entry parser
//!
//! Decomposes a (usually gzip-compressed) UniProtKB XML corpus into a
//! lazy sequence of [`Entry`] records. Exactly one `<entry>` subtree is
//! materialized at a time and dropped as soon as its record has been
//! extracted, so peak memory is bounded by the single largest entry no
//! matter how large the file is.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use tracing::debug;

use crate::error::{EtlError, Result};
use crate::model::{Entry, Gene, Keyword, XmlNode};

/// Streaming reader over one UniProtKB XML document.
pub struct EntryReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    skip_buf: Vec<u8>,
    release: Option<String>,
    preamble_done: bool,
    finished: bool,
}

enum Step {
    Entry(XmlNode),
    EmptyEntry(XmlNode),
    Skip(Vec<u8>),
    Done,
    Other,
}

impl EntryReader<Box<dyn BufRead + Send>> {
    /// Open a corpus file, decompressing when the extension is `.gz`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let input: Box<dyn BufRead + Send> =
            if path.extension().and_then(|s| s.to_str()) == Some("gz") {
                Box::new(BufReader::new(GzDecoder::new(file)))
            } else {
                Box::new(BufReader::new(file))
            };
        Ok(Self::from_reader(input))
    }
}

impl<R: BufRead> EntryReader<R> {
    pub fn from_reader(input: R) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::with_capacity(8 * 1024),
            skip_buf: Vec::new(),
            release: None,
            preamble_done: false,
            finished: false,
        }
    }

    /// Release tag from the root element's `release` attribute, if present.
    /// Available before the first entry is read.
    pub fn release(&mut self) -> Result<Option<&str>> {
        self.read_preamble()?;
        Ok(self.release.as_deref())
    }

    /// Next entry in document order; `Ok(None)` at end of input.
    ///
    /// [`EtlError::InvalidEntry`] marks a single malformed entry and the
    /// reader stays usable; any other error is terminal.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.read_preamble()?;
        if self.finished {
            return Ok(None);
        }
        loop {
            let step = self.next_step()?;
            match step {
                Step::Entry(root) => {
                    let node = self.read_subtree(root)?;
                    return extract_entry(&node).map(Some);
                }
                Step::EmptyEntry(root) => return extract_entry(&root).map(Some),
                Step::Skip(name) => {
                    self.skip_buf.clear();
                    self.reader
                        .read_to_end_into(QName(&name), &mut self.skip_buf)
                        .map_err(xml_fatal)?;
                }
                Step::Done => {
                    self.finished = true;
                    return Ok(None);
                }
                Step::Other => {}
            }
        }
    }

    fn read_preamble(&mut self) -> Result<()> {
        if self.preamble_done {
            return Ok(());
        }
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf).map_err(xml_fatal)? {
                Event::Start(e) => {
                    for attr in e.attributes() {
                        let attr = attr.map_err(xml_fatal)?;
                        if attr.key.local_name().as_ref() == b"release" {
                            self.release =
                                Some(attr.unescape_value().map_err(xml_fatal)?.into_owned());
                        }
                    }
                    debug!(release = ?self.release, "read document root");
                    self.preamble_done = true;
                    return Ok(());
                }
                Event::Eof => {
                    self.preamble_done = true;
                    self.finished = true;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn next_step(&mut self) -> Result<Step> {
        self.buf.clear();
        let step = match self.reader.read_event_into(&mut self.buf).map_err(xml_fatal)? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"entry" {
                    Step::Entry(node_from_start(&e)?)
                } else {
                    Step::Skip(e.name().as_ref().to_vec())
                }
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"entry" {
                    Step::EmptyEntry(node_from_start(&e)?)
                } else {
                    Step::Other
                }
            }
            Event::End(_) | Event::Eof => Step::Done,
            _ => Step::Other,
        };
        Ok(step)
    }

    /// Materialize the subtree under an already-read start tag. The
    /// returned tree is the only copy of the element; dropping it releases
    /// all memory for the entry.
    fn read_subtree(&mut self, root: XmlNode) -> Result<XmlNode> {
        let mut stack = vec![root];
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf).map_err(xml_fatal)? {
                Event::Start(e) => stack.push(node_from_start(&e)?),
                Event::Empty(e) => {
                    let child = node_from_start(&e)?;
                    stack
                        .last_mut()
                        .expect("subtree stack cannot be empty")
                        .children
                        .push(child);
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(xml_fatal)?;
                    if !text.is_empty() {
                        append_text(
                            stack.last_mut().expect("subtree stack cannot be empty"),
                            &text,
                        );
                    }
                }
                Event::CData(t) => {
                    let raw = t.into_inner();
                    let text = String::from_utf8_lossy(&raw);
                    append_text(
                        stack.last_mut().expect("subtree stack cannot be empty"),
                        &text,
                    );
                }
                Event::End(_) => {
                    let done = stack.pop().expect("subtree stack cannot be empty");
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => return Ok(done),
                    }
                }
                Event::Eof => {
                    return Err(EtlError::TransformFailure(
                        "unexpected end of input inside an <entry> element".into(),
                    ))
                }
                _ => {}
            }
        }
    }
}

/// Read just the release tag from a corpus file without parsing entries.
pub fn peek_release(path: &Path) -> Result<Option<String>> {
    let mut reader = EntryReader::open(path)?;
    Ok(reader.release()?.map(str::to_string))
}

fn xml_fatal(err: impl std::fmt::Display) -> EtlError {
    EtlError::TransformFailure(format!("xml parse error: {err}"))
}

fn node_from_start(e: &BytesStart<'_>) -> Result<XmlNode> {
    let mut node = XmlNode::new(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr.map_err(xml_fatal)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_fatal)?.into_owned();
        node.attributes.insert(key, value);
    }
    Ok(node)
}

fn append_text(node: &mut XmlNode, text: &str) {
    match &mut node.text {
        Some(existing) => existing.push_str(text),
        None => node.text = Some(text.to_string()),
    }
}

fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    value.and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
}

fn collect_evidence(node: &XmlNode, out: &mut Vec<XmlNode>) {
    for child in &node.children {
        if child.tag == "evidence" {
            out.push(child.clone());
        }
        collect_evidence(child, out);
    }
}

/// Extract the flat record from a materialized `<entry>` subtree.
fn extract_entry(node: &XmlNode) -> Result<Entry> {
    let mut accessions = node
        .children_named("accession")
        .filter_map(|c| c.text.clone());
    let primary_accession = accessions.next().ok_or_else(|| {
        let name = node
            .child("name")
            .and_then(|n| n.text.as_deref())
            .unwrap_or("<unnamed>");
        EtlError::InvalidEntry(format!("entry '{name}' has no <accession>"))
    })?;
    let secondary_accessions: Vec<String> = accessions.collect();

    let uniprot_id = node.child("name").and_then(|n| n.text.clone());

    let protein_name = node.child("protein").and_then(|protein| {
        protein
            .child("recommendedName")
            .or_else(|| protein.child("submittedName"))
            .and_then(|n| n.child("fullName"))
            .and_then(|n| n.text.clone())
    });

    let organism = node.child("organism");
    let organism_scientific_name = organism.and_then(|org| {
        org.children_named("name")
            .find(|n| n.attr("type") == Some("scientific"))
            .and_then(|n| n.text.clone())
    });
    let ncbi_taxid = organism.and_then(|org| {
        org.children_named("dbReference")
            .find(|r| r.attr("type") == Some("NCBI Taxonomy"))
            .and_then(|r| r.attr("id"))
            .and_then(|id| id.parse::<i64>().ok())
    });
    let organism_lineage = organism.and_then(|org| {
        let taxa: Vec<&str> = org
            .child("lineage")
            .map(|lineage| {
                lineage
                    .children_named("taxon")
                    .filter_map(|t| t.text.as_deref())
                    .collect()
            })
            .unwrap_or_default();
        if taxa.is_empty() {
            None
        } else {
            Some(taxa.join("; "))
        }
    });

    let sequence_elem = node.child("sequence");
    let sequence_length = sequence_elem
        .and_then(|s| s.attr("length"))
        .and_then(|v| v.parse::<i32>().ok());
    let molecular_weight = sequence_elem
        .and_then(|s| s.attr("mass"))
        .and_then(|v| v.parse::<i32>().ok());
    let sequence = sequence_elem.and_then(|s| {
        s.text
            .as_deref()
            .map(|t| t.chars().filter(|c| !c.is_whitespace()).collect::<String>())
    });

    let genes = node
        .children_named("gene")
        .flat_map(|gene| gene.children_named("name"))
        .filter_map(|name| {
            name.text.clone().map(|text| Gene {
                name: text,
                is_primary: name.attr("type") == Some("primary"),
            })
        })
        .collect();

    let keywords = node
        .children_named("keyword")
        .filter_map(|kw| {
            let id = kw.attr("id")?.to_string();
            let label = kw.text.clone().unwrap_or_default();
            Some(Keyword { id, label })
        })
        .collect();

    let mut go_terms = Vec::new();
    let mut db_references = Vec::new();
    for reference in node.children_named("dbReference") {
        match reference.attr("type") {
            Some("GO") => {
                if let Some(id) = reference.attr("id") {
                    go_terms.push(id.to_string());
                }
            }
            Some("NCBI Taxonomy") => {}
            _ => db_references.push(reference.clone()),
        }
    }

    let comments: Vec<XmlNode> = node.children_named("comment").cloned().collect();
    let features: Vec<XmlNode> = node.children_named("feature").cloned().collect();
    let mut evidence = Vec::new();
    collect_evidence(node, &mut evidence);

    Ok(Entry {
        primary_accession,
        secondary_accessions,
        uniprot_id,
        protein_name,
        ncbi_taxid,
        organism_scientific_name,
        organism_lineage,
        sequence_length,
        molecular_weight,
        sequence,
        created_date: parse_date(node.attr("created")),
        modified_date: parse_date(node.attr("modified")),
        genes,
        keywords,
        go_terms,
        comments,
        features,
        db_references,
        evidence,
    })
}
