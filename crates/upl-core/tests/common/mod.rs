//! Shared test support: an in-memory adapter that mimics the semantics
//! the pipeline needs from the target store, plus XML corpus builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use uuid::Uuid;

use upl_core::adapter::{DatabaseAdapter, ReleaseRecord, RunRecord, RunStatus};
use upl_core::error::{EtlError, Result};
use upl_core::schema::{self, TableDef};
use upl_core::Settings;

pub type Row = Vec<Option<String>>;

#[derive(Debug, Clone, Default)]
pub struct SchemaState {
    pub tables: BTreeMap<String, Vec<Row>>,
    pub releases: Vec<ReleaseRecord>,
    pub history: Vec<HistoryRow>,
}

#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub run_id: Uuid,
    pub status: String,
    pub mode: Option<String>,
    pub dataset: Option<String>,
    pub error: Option<String>,
}

/// In-memory stand-in for the reference adapter. Tables are vectors of
/// decoded spool rows; schema renames move whole maps, mirroring how a
/// schema swap behaves for readers.
#[derive(Default)]
pub struct MockAdapter {
    state: Mutex<BTreeMap<String, SchemaState>>,
    pub fail_swap: AtomicBool,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema_names(&self) -> Vec<String> {
        self.state.lock().unwrap().keys().cloned().collect()
    }

    pub fn rows(&self, schema: &str, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .unwrap()
            .get(schema)
            .and_then(|s| s.tables.get(table))
            .cloned()
            .unwrap_or_default()
    }

    /// First-column values of a table, sorted.
    pub fn keys(&self, schema: &str, table: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .rows(schema, table)
            .into_iter()
            .filter_map(|row| row.first().cloned().flatten())
            .collect();
        keys.sort();
        keys
    }

    pub fn releases(&self, schema: &str) -> Vec<ReleaseRecord> {
        self.state
            .lock()
            .unwrap()
            .get(schema)
            .map(|s| s.releases.clone())
            .unwrap_or_default()
    }

    pub fn history(&self, schema: &str) -> Vec<HistoryRow> {
        self.state
            .lock()
            .unwrap()
            .get(schema)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    fn pk_positions(table: &TableDef) -> Vec<usize> {
        table
            .primary_key
            .iter()
            .map(|key| {
                table
                    .columns
                    .iter()
                    .position(|c| c.name == *key)
                    .expect("primary key column exists")
            })
            .collect()
    }

    fn pk_of(row: &Row, positions: &[usize]) -> Vec<Option<String>> {
        positions.iter().map(|&i| row.get(i).cloned().flatten()).collect()
    }
}

fn decode_field(field: &str) -> Option<String> {
    if field == "\\N" {
        return None;
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('t') => out.push('\t'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('\\') => out.push('\\'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

pub fn decode_line(line: &str) -> Row {
    line.split('\t').map(decode_field).collect()
}

pub fn read_spool(path: &Path) -> Vec<Row> {
    let file = std::fs::File::open(path).expect("spool file opens");
    let mut content = String::new();
    GzDecoder::new(file)
        .read_to_string(&mut content)
        .expect("spool file is valid gzip");
    content.lines().map(decode_line).collect()
}

#[async_trait]
impl DatabaseAdapter for MockAdapter {
    async fn ensure_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn create_schema(&self, schema: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_schema(&self, schema: &str) -> Result<()> {
        self.state.lock().unwrap().remove(schema);
        Ok(())
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().contains_key(schema))
    }

    async fn apply_table_definitions(&self, schema: &str, catalog: &[TableDef]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let schema_state = state
            .get_mut(schema)
            .ok_or_else(|| EtlError::Database(format!("schema '{schema}' does not exist")))?;
        for table in catalog {
            schema_state.tables.entry(table.name.to_string()).or_default();
        }
        Ok(())
    }

    async fn bulk_ingest(&self, schema: &str, table: &TableDef, spool: &Path) -> Result<u64> {
        let rows = read_spool(spool);
        let count = rows.len() as u64;
        let mut state = self.state.lock().unwrap();
        let table_rows = state
            .get_mut(schema)
            .and_then(|s| s.tables.get_mut(table.name))
            .ok_or_else(|| EtlError::BulkIngestFailure {
                table: table.name.to_string(),
                message: format!("table '{schema}.{}' does not exist", table.name),
            })?;
        table_rows.extend(rows);
        Ok(count)
    }

    async fn create_indexes(&self, _schema: &str, _catalog: &[TableDef]) -> Result<()> {
        Ok(())
    }

    async fn analyze_schema(&self, _schema: &str) -> Result<()> {
        Ok(())
    }

    async fn rename_schema(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let schema_state = state
            .remove(from)
            .ok_or_else(|| EtlError::Database(format!("schema '{from}' does not exist")))?;
        state.insert(to.to_string(), schema_state);
        Ok(())
    }

    async fn commit_schema_swap(
        &self,
        production: &str,
        staging: &str,
        archive: &str,
        release: &ReleaseRecord,
    ) -> Result<()> {
        if self.fail_swap.load(Ordering::SeqCst) {
            return Err(EtlError::CutoverFailure("injected rename failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        let staged = state
            .remove(staging)
            .ok_or_else(|| EtlError::CutoverFailure(format!("schema '{staging}' does not exist")))?;
        if let Some(previous) = state.remove(production) {
            state.insert(archive.to_string(), previous);
        }
        state.insert(production.to_string(), staged);
        let schema_state = state.get_mut(production).expect("production just inserted");
        schema_state.releases.retain(|r| r.version != release.version);
        schema_state.releases.push(release.clone());
        Ok(())
    }

    async fn upsert_from_staging(
        &self,
        staging: &str,
        production: &str,
        table: &TableDef,
    ) -> Result<u64> {
        let positions = Self::pk_positions(table);
        let mut state = self.state.lock().unwrap();
        let staged = state
            .get(staging)
            .and_then(|s| s.tables.get(table.name))
            .cloned()
            .unwrap_or_default();
        let target = state
            .get_mut(production)
            .and_then(|s| s.tables.get_mut(table.name))
            .ok_or_else(|| EtlError::Database(format!("table '{production}.{}' missing", table.name)))?;
        let mut merged = 0u64;
        for row in staged {
            let key = Self::pk_of(&row, &positions);
            if let Some(existing) = target
                .iter_mut()
                .find(|r| Self::pk_of(r, &positions) == key)
            {
                *existing = row;
            } else {
                target.push(row);
            }
            merged += 1;
        }
        Ok(merged)
    }

    async fn replace_protein_scoped(
        &self,
        staging: &str,
        production: &str,
        table: &TableDef,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let staged_proteins: HashSet<Option<String>> = state
            .get(staging)
            .and_then(|s| s.tables.get(schema::PROTEINS))
            .map(|rows| rows.iter().map(|r| r.first().cloned().flatten()).collect())
            .unwrap_or_default();
        let staged = state
            .get(staging)
            .and_then(|s| s.tables.get(table.name))
            .cloned()
            .unwrap_or_default();
        let target = state
            .get_mut(production)
            .and_then(|s| s.tables.get_mut(table.name))
            .ok_or_else(|| EtlError::Database(format!("table '{production}.{}' missing", table.name)))?;
        target.retain(|row| !staged_proteins.contains(&row.first().cloned().flatten()));
        let inserted = staged.len() as u64;
        target.extend(staged);
        Ok(inserted)
    }

    async fn delete_missing_proteins(&self, staging: &str, production: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let staged_accessions: HashSet<Option<String>> = state
            .get(staging)
            .and_then(|s| s.tables.get(schema::PROTEINS))
            .map(|rows| rows.iter().map(|r| r.first().cloned().flatten()).collect())
            .unwrap_or_default();
        let schema_state = state
            .get_mut(production)
            .ok_or_else(|| EtlError::Database(format!("schema '{production}' does not exist")))?;

        let removed_accessions: HashSet<Option<String>> = schema_state
            .tables
            .get(schema::PROTEINS)
            .map(|rows| {
                rows.iter()
                    .map(|r| r.first().cloned().flatten())
                    .filter(|acc| !staged_accessions.contains(acc))
                    .collect()
            })
            .unwrap_or_default();
        let removed = removed_accessions.len() as u64;

        if let Some(rows) = schema_state.tables.get_mut(schema::PROTEINS) {
            rows.retain(|r| !removed_accessions.contains(&r.first().cloned().flatten()));
        }
        // Children follow via cascade.
        for table in schema::data_tables() {
            if table.name == schema::PROTEINS || table.name == schema::TAXONOMY {
                continue;
            }
            if let Some(rows) = schema_state.tables.get_mut(table.name) {
                rows.retain(|r| !removed_accessions.contains(&r.first().cloned().flatten()));
            }
        }
        Ok(removed)
    }

    async fn deduplicate_staging(&self, schema_name: &str, table: &TableDef) -> Result<u64> {
        let positions = Self::pk_positions(table);
        let mut state = self.state.lock().unwrap();
        let rows = state
            .get_mut(schema_name)
            .and_then(|s| s.tables.get_mut(table.name))
            .ok_or_else(|| EtlError::Database(format!("table '{schema_name}.{}' missing", table.name)))?;
        let before = rows.len();
        let mut seen = HashSet::new();
        rows.retain(|row| seen.insert(Self::pk_of(row, &positions)));
        Ok((before - rows.len()) as u64)
    }

    async fn current_release(&self, schema: &str) -> Result<Option<ReleaseRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(schema)
            .and_then(|s| s.releases.iter().max_by_key(|r| r.load_timestamp).cloned()))
    }

    async fn write_release(&self, schema: &str, release: &ReleaseRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let schema_state = state
            .get_mut(schema)
            .ok_or_else(|| EtlError::Database(format!("schema '{schema}' does not exist")))?;
        schema_state.releases.retain(|r| r.version != release.version);
        schema_state.releases.push(release.clone());
        Ok(())
    }

    async fn insert_run(&self, schema: &str, run: &RunRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let schema_state = state
            .get_mut(schema)
            .ok_or_else(|| EtlError::Database(format!("schema '{schema}' does not exist")))?;
        schema_state.history.push(HistoryRow {
            run_id: run.run_id,
            status: run.status.as_str().to_string(),
            mode: Some(run.mode.to_string()),
            dataset: Some(run.dataset.to_string()),
            error: None,
        });
        Ok(())
    }

    async fn finish_run(
        &self,
        schema: &str,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let schema_state = state
            .get_mut(schema)
            .ok_or_else(|| EtlError::Database(format!("schema '{schema}' does not exist")))?;
        match schema_state.history.iter_mut().find(|h| h.run_id == run_id) {
            Some(row) => {
                row.status = status.as_str().to_string();
                row.error = error.map(str::to_string);
            }
            None => schema_state.history.push(HistoryRow {
                run_id,
                status: status.as_str().to_string(),
                mode: None,
                dataset: None,
                error: error.map(str::to_string),
            }),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// XML corpus builders
// ---------------------------------------------------------------------------

/// One complete `<entry>` with a gene, a GO term, a keyword and a
/// secondary accession, in the shape the public corpus uses.
pub fn entry_xml(accession: &str, secondary: &str, gene: &str, modified: &str) -> String {
    format!(
        r#"<entry dataset="Swiss-Prot" created="2000-05-30" modified="{modified}" version="3">
  <accession>{accession}</accession>
  <accession>{secondary}</accession>
  <name>{accession}_HUMAN</name>
  <protein><recommendedName><fullName>Protein {accession}</fullName></recommendedName></protein>
  <gene><name type="primary">{gene}</name></gene>
  <organism>
    <name type="scientific">Homo sapiens</name>
    <dbReference type="NCBI Taxonomy" id="9606"/>
    <lineage><taxon>Eukaryota</taxon><taxon>Metazoa</taxon></lineage>
  </organism>
  <dbReference type="GO" id="GO:0005515"/>
  <keyword id="KW-0181">Complete proteome</keyword>
  <comment type="function"><text>Does something in {accession}.</text></comment>
  <sequence length="10" mass="1111">MTESTSEQAA</sequence>
</entry>"#
    )
}

/// An `<entry>` with no accession at all, which the parser must reject.
pub fn invalid_entry_xml() -> String {
    r#"<entry created="2020-01-01" modified="2020-01-01">
  <name>BROKEN_ENTRY</name>
  <sequence length="4" mass="400">MAAA</sequence>
</entry>"#
        .to_string()
}

pub fn corpus(release: &str, entries: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<uniprot xmlns=\"http://uniprot.org/uniprot\" release=\"{release}\">\n{}\n</uniprot>\n",
        entries.join("\n")
    )
}

pub fn write_gz(path: &Path, content: &str) {
    use std::io::Write;
    let file = std::fs::File::create(path).expect("fixture file creates");
    let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    encoder
        .write_all(content.as_bytes())
        .expect("fixture content writes");
    encoder.finish().expect("fixture gzip finishes");
}

/// Write a Swiss-Prot corpus into `data_dir` and return matching settings.
pub fn settings_with_corpus(data_dir: &Path, xml: &str) -> Settings {
    std::fs::create_dir_all(data_dir).expect("data dir creates");
    write_gz(&data_dir.join("uniprot_sprot.xml.gz"), xml);
    Settings {
        data_dir: data_dir.to_path_buf(),
        profile: upl_core::Profile::Full,
        workers: 2,
        ..Settings::default()
    }
}
