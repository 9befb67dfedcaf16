//! Pipeline facade
//!
//! The single programmatic entry point: resolve the selected dataset to
//! input files, hand everything to the load director, and surface either
//! a [`LoadSummary`] or a typed error. Nothing here talks to the database
//! directly.

use tracing::info;

use crate::adapter::{DatabaseAdapter, ReleaseRecord};
use crate::config::Settings;
use crate::director::{DatasetInput, LoadDirector, LoadSummary};
use crate::error::{EtlError, Result};
use crate::model::{Dataset, LoadMode};
use crate::schema;
use crate::transform::CancelToken;

pub struct UniprotPipeline<A: DatabaseAdapter> {
    settings: Settings,
    adapter: A,
}

impl<A: DatabaseAdapter> UniprotPipeline<A> {
    pub fn new(settings: Settings, adapter: A) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings, adapter })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Run one load. Blocks until the run reaches a terminal state.
    pub async fn run(&self, mode: LoadMode, dataset: Dataset) -> Result<LoadSummary> {
        self.run_cancellable(mode, dataset, CancelToken::new()).await
    }

    /// Run one load with an external cancellation handle.
    pub async fn run_cancellable(
        &self,
        mode: LoadMode,
        dataset: Dataset,
        cancel: CancelToken,
    ) -> Result<LoadSummary> {
        self.adapter.ensure_connection().await?;
        let inputs = self.resolve_inputs(dataset)?;
        info!(%mode, %dataset, files = inputs.len(), "pipeline run requested");
        LoadDirector::new(&self.adapter, &self.settings)
            .run(mode, dataset, &inputs, cancel)
            .await
    }

    /// Currently loaded release, or None on a fresh database.
    pub async fn status(&self) -> Result<Option<ReleaseRecord>> {
        self.adapter.ensure_connection().await?;
        self.adapter
            .current_release(&self.settings.production_schema)
            .await
    }

    /// First-time setup: create the production schema and its tables.
    /// Idempotent; safe against an existing installation.
    pub async fn initialize(&self) -> Result<()> {
        self.adapter.ensure_connection().await?;
        let production = &self.settings.production_schema;
        self.adapter.create_schema(production).await?;
        self.adapter
            .apply_table_definitions(production, schema::TABLES)
            .await?;
        info!(schema = %production, "production schema initialized");
        Ok(())
    }

    fn resolve_inputs(&self, dataset: Dataset) -> Result<Vec<DatasetInput>> {
        dataset
            .expand()
            .into_iter()
            .map(|d| {
                let path = self.settings.data_dir.join(d.file_name());
                if !path.exists() {
                    return Err(EtlError::Config(format!(
                        "source file not found for dataset '{d}': {}",
                        path.display()
                    )));
                }
                Ok(DatasetInput { dataset: d, path })
            })
            .collect()
    }
}
