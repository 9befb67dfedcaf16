//! Bulk load executor
//!
//! Drives the adapter to ingest every spool file in a run directory into
//! its staging table, in catalog order. Each table load runs in its own
//! transaction on the adapter side; a failure names the offending table
//! and leaves the staging schema for the director to drop.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use crate::adapter::DatabaseAdapter;
use crate::error::Result;
use crate::schema::{self, TableDef};

/// Per-table row counts reported by a successful bulk load.
pub type IngestReport = BTreeMap<&'static str, u64>;

pub struct BulkLoadExecutor<'a> {
    adapter: &'a dyn DatabaseAdapter,
}

impl<'a> BulkLoadExecutor<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter) -> Self {
        Self { adapter }
    }

    /// Ingest all spool files found under `spool_dir` into `schema`.
    ///
    /// Tables without a spool file received no rows during transform and
    /// are skipped; the catalog order guarantees parents load before
    /// children, so foreign keys hold at every commit point.
    pub async fn load_all(&self, schema: &str, spool_dir: &Path) -> Result<IngestReport> {
        let mut report = IngestReport::new();
        for table in schema::data_tables() {
            let spool = spool_dir.join(schema::spool_file_name(table.name));
            if !spool.exists() {
                debug!(table = table.name, "no spool file, skipping");
                continue;
            }
            let rows = self.load_table(schema, table, &spool).await?;
            report.insert(table.name, rows);
        }
        info!(
            schema,
            tables = report.len(),
            total_rows = report.values().sum::<u64>(),
            "bulk load complete"
        );
        Ok(report)
    }

    async fn load_table(&self, schema: &str, table: &TableDef, spool: &Path) -> Result<u64> {
        debug!(table = table.name, spool = %spool.display(), "bulk ingest starting");
        let rows = self.adapter.bulk_ingest(schema, table, spool).await?;
        info!(table = table.name, rows, "bulk ingest finished");
        Ok(rows)
    }
}
