//! Metadata registry
//!
//! Bookkeeping over the two small fixed tables: one release row per
//! loaded version and one `load_history` row per run. Both live inside
//! whichever schema currently carries the production name, so they travel
//! with a full-load cutover; history written before the swap stays in the
//! archived schema.

use tracing::warn;
use uuid::Uuid;

use crate::adapter::{DatabaseAdapter, ReleaseRecord, RunRecord, RunStatus};
use crate::error::Result;

pub struct MetadataRegistry<'a> {
    adapter: &'a dyn DatabaseAdapter,
    schema: &'a str,
}

impl<'a> MetadataRegistry<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter, schema: &'a str) -> Self {
        Self { adapter, schema }
    }

    /// Release currently loaded, or None on a fresh database.
    pub async fn current_release(&self) -> Result<Option<ReleaseRecord>> {
        self.adapter.current_release(self.schema).await
    }

    /// Record a starting run as `running`.
    pub async fn begin_run(&self, run: &RunRecord) -> Result<()> {
        self.adapter.insert_run(self.schema, run).await
    }

    /// Close a run with its terminal status. Best effort: a bookkeeping
    /// failure after the data work finished must not fail the run itself.
    pub async fn close_run(&self, run_id: Uuid, status: RunStatus, error: Option<&str>) {
        if let Err(err) = self
            .adapter
            .finish_run(self.schema, run_id, status, error)
            .await
        {
            warn!(%run_id, %status, error = %err, "failed to close load_history row");
        }
    }

    /// Insert or update the release row, marking it current.
    pub async fn record_release(&self, release: &ReleaseRecord) -> Result<()> {
        self.adapter.write_release(self.schema, release).await
    }
}
