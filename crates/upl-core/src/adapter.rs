//! Database adapter contract
//!
//! The narrow capability interface the pipeline depends on. The reference
//! implementation targets PostgreSQL; alternative stores plug in by
//! implementing this trait without touching the core. No other database
//! access is permitted from the pipeline.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Dataset, LoadMode};
use crate::schema::TableDef;

/// One row of `py_load_uniprot_metadata`; the row with the newest
/// `load_timestamp` is the current release.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRecord {
    pub version: String,
    pub release_date: Option<NaiveDate>,
    pub load_timestamp: DateTime<Utc>,
    pub swissprot_entry_count: i64,
    pub trembl_entry_count: i64,
}

/// Terminal and non-terminal states of a `load_history` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `load_history`, written at run start and closed at the end.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub mode: LoadMode,
    pub dataset: Dataset,
    pub start_time: DateTime<Utc>,
}

impl RunRecord {
    pub fn started(run_id: Uuid, mode: LoadMode, dataset: Dataset) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            mode,
            dataset,
            start_time: Utc::now(),
        }
    }
}

/// Capability contract between the pipeline and the target store.
///
/// Schema and table names are interpolated by implementations; callers
/// only ever pass catalog names and validated settings. `bulk_ingest`
/// must use the store's native bulk path; row-by-row insertion is a
/// contract violation, not an optimization choice.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Verify the store is reachable before any state mutation.
    async fn ensure_connection(&self) -> Result<()>;

    /// Create a schema if absent; idempotent.
    async fn create_schema(&self, schema: &str) -> Result<()>;

    /// Drop a schema and everything in it; idempotent.
    async fn drop_schema(&self, schema: &str) -> Result<()>;

    async fn schema_exists(&self, schema: &str) -> Result<bool>;

    /// Create all catalog tables and their constraints; idempotent.
    async fn apply_table_definitions(&self, schema: &str, catalog: &[TableDef]) -> Result<()>;

    /// Stream a spool file into `schema.table` over the native bulk
    /// protocol, inside its own transaction. Returns the row count.
    async fn bulk_ingest(&self, schema: &str, table: &TableDef, spool: &Path) -> Result<u64>;

    /// Build the post-load indexes for the catalog.
    async fn create_indexes(&self, schema: &str, catalog: &[TableDef]) -> Result<()>;

    /// Refresh planner statistics for the schema.
    async fn analyze_schema(&self, schema: &str) -> Result<()>;

    /// Single-statement schema rename.
    async fn rename_schema(&self, from: &str, to: &str) -> Result<()>;

    /// Atomic cutover: rename production to `archive` (when production
    /// exists), rename staging to production and record the new release,
    /// all in one transaction. No intermediate state is observable.
    async fn commit_schema_swap(
        &self,
        production: &str,
        staging: &str,
        archive: &str,
        release: &ReleaseRecord,
    ) -> Result<()>;

    /// Insert-or-update production rows from staging on the table's
    /// primary key; all non-key columns are updatable. Idempotent.
    async fn upsert_from_staging(
        &self,
        staging: &str,
        production: &str,
        table: &TableDef,
    ) -> Result<u64>;

    /// Replace the per-protein row sets of a child table: delete all
    /// production rows whose protein appears in staging, then insert the
    /// staged rows. Idempotent.
    async fn replace_protein_scoped(
        &self,
        staging: &str,
        production: &str,
        table: &TableDef,
    ) -> Result<u64>;

    /// Remove production proteins whose accession is absent from staging.
    /// Only invoked under the hard-delete obsolete policy.
    async fn delete_missing_proteins(&self, staging: &str, production: &str) -> Result<u64>;

    /// Drop duplicate staged rows sharing a primary key, keeping one.
    /// Needed when several datasets load into the same staging schema.
    async fn deduplicate_staging(&self, schema: &str, table: &TableDef) -> Result<u64>;

    /// Current release row, or None when nothing has been loaded.
    async fn current_release(&self, schema: &str) -> Result<Option<ReleaseRecord>>;

    /// Insert or update a release row, marking it current.
    async fn write_release(&self, schema: &str, release: &ReleaseRecord) -> Result<()>;

    /// Insert the `load_history` row for a starting run.
    async fn insert_run(&self, schema: &str, run: &RunRecord) -> Result<()>;

    /// Close a `load_history` row with its terminal status.
    async fn finish_run(
        &self,
        schema: &str,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_strings_match_history_values() {
        assert_eq!(RunStatus::Running.as_str(), "running");
        assert_eq!(RunStatus::Succeeded.as_str(), "succeeded");
        assert_eq!(RunStatus::Failed.as_str(), "failed");
        assert_eq!(RunStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn started_run_is_running() {
        let run = RunRecord::started(Uuid::new_v4(), LoadMode::Full, Dataset::Swissprot);
        assert_eq!(run.status, RunStatus::Running);
    }
}
