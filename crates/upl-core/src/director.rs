//! Load strategy director
//!
//! Orchestrates one run end to end: staging schema creation, parallel
//! transform, bulk load, and either the atomic schema swap (full load) or
//! the stage-then-merge sequence (delta load). All failure paths drop the
//! staging schema and close the `load_history` row; production is never
//! left in a partially-loaded state.

use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::{DatabaseAdapter, ReleaseRecord, RunRecord, RunStatus};
use crate::bulk::{BulkLoadExecutor, IngestReport};
use crate::config::{ObsoletePolicy, Settings};
use crate::error::{EtlError, Result};
use crate::metadata::MetadataRegistry;
use crate::model::{Dataset, LoadMode};
use crate::schema::{self, MergeStrategy};
use crate::transform::{self, CancelToken, TransformOptions, TransformReport};
use crate::xml;

/// One resolved XML input for a run.
#[derive(Debug, Clone)]
pub struct DatasetInput {
    pub dataset: Dataset,
    pub path: PathBuf,
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub mode: LoadMode,
    pub release: String,
    /// True when a delta found the database already on this release and
    /// did nothing.
    pub up_to_date: bool,
    pub entries: u64,
    pub skipped_entries: u64,
    pub tables: IngestReport,
}

impl LoadSummary {
    fn up_to_date(run_id: Uuid, mode: LoadMode, release: String) -> Self {
        Self {
            run_id,
            mode,
            release,
            up_to_date: true,
            entries: 0,
            skipped_entries: 0,
            tables: IngestReport::new(),
        }
    }
}

pub struct LoadDirector<'a> {
    adapter: &'a dyn DatabaseAdapter,
    settings: &'a Settings,
}

impl<'a> LoadDirector<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter, settings: &'a Settings) -> Self {
        Self { adapter, settings }
    }

    /// Execute one run. `dataset` is the operator's selection as recorded
    /// in `load_history`; `inputs` is its expansion to concrete files.
    pub async fn run(
        &self,
        mode: LoadMode,
        dataset: Dataset,
        inputs: &[DatasetInput],
        cancel: CancelToken,
    ) -> Result<LoadSummary> {
        if inputs.is_empty() {
            return Err(EtlError::Config("no input files resolved for run".into()));
        }
        let production = self.settings.production_schema.as_str();
        let registry = MetadataRegistry::new(self.adapter, production);
        let release = self.resolve_release(inputs).await?;
        let staging = staging_schema_name(production, &release);

        if mode == LoadMode::Delta {
            if let Some(current) = registry.current_release().await? {
                if current.version == release {
                    info!(version = %release, "database is already on this release, delta is a no-op");
                    return Ok(LoadSummary::up_to_date(Uuid::new_v4(), mode, release));
                }
                if release < current.version {
                    return Err(EtlError::Config(format!(
                        "source release '{release}' is older than loaded release '{}'",
                        current.version
                    )));
                }
            }
        }

        // The metadata tables live in production. A fresh database has no
        // production schema yet; creating one just to hold the running row
        // would get archived at cutover, so in that case history starts
        // with the terminal row written after the swap.
        let production_exists = self.adapter.schema_exists(production).await?;
        let run = RunRecord::started(Uuid::new_v4(), mode, dataset);
        if production_exists || mode == LoadMode::Delta {
            self.adapter.create_schema(production).await?;
            self.adapter
                .apply_table_definitions(production, schema::TABLES)
                .await?;
            registry.begin_run(&run).await?;
        }
        info!(run_id = %run.run_id, %mode, %dataset, version = %release, "starting load run");

        let spool_root = self
            .settings
            .data_dir
            .join("spool")
            .join(run.run_id.to_string());

        let result = match mode {
            LoadMode::Full => {
                self.full_load(&run, &release, &staging, &spool_root, inputs, &cancel)
                    .await
            }
            LoadMode::Delta => {
                self.delta_load(&run, &release, &staging, &spool_root, inputs, &cancel)
                    .await
            }
        };

        transform::remove_spool_dir(&spool_root);

        match result {
            Ok(summary) => {
                // After a full load the production name points at the new
                // schema; the terminal row is written there by design.
                registry.close_run(run.run_id, RunStatus::Succeeded, None).await;
                info!(run_id = %run.run_id, version = %release, "load run succeeded");
                Ok(summary)
            }
            Err(err) => {
                if let Err(drop_err) = self.adapter.drop_schema(&staging).await {
                    warn!(schema = %staging, error = %drop_err, "failed to drop staging schema");
                }
                let status = match err {
                    EtlError::Cancelled => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                registry
                    .close_run(run.run_id, status, Some(&err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Full load: build everything in staging, then cut over atomically.
    async fn full_load(
        &self,
        run: &RunRecord,
        release: &str,
        staging: &str,
        spool_root: &std::path::Path,
        inputs: &[DatasetInput],
        cancel: &CancelToken,
    ) -> Result<LoadSummary> {
        let production = self.settings.production_schema.as_str();
        let archive = archive_schema_name(production);

        let (reports, ingest) = self
            .stage(staging, spool_root, inputs, cancel)
            .await?;

        self.adapter.create_indexes(staging, schema::TABLES).await?;
        self.adapter.analyze_schema(staging).await?;

        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }

        let release_record = self.build_release_record(release, &reports);
        self.adapter
            .commit_schema_swap(production, staging, &archive, &release_record)
            .await?;
        info!(%production, %archive, "schema cutover committed");

        Ok(summarize(run, LoadMode::Full, release, &reports, ingest))
    }

    /// Delta load: stage, then merge parents-first into production.
    async fn delta_load(
        &self,
        run: &RunRecord,
        release: &str,
        staging: &str,
        spool_root: &std::path::Path,
        inputs: &[DatasetInput],
        cancel: &CancelToken,
    ) -> Result<LoadSummary> {
        let production = self.settings.production_schema.as_str();

        let (reports, ingest) = self
            .stage(staging, spool_root, inputs, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }

        for table in schema::data_tables() {
            let rows = match table.merge {
                MergeStrategy::Upsert => {
                    self.adapter
                        .upsert_from_staging(staging, production, table)
                        .await?
                }
                MergeStrategy::ReplaceByProtein => {
                    self.adapter
                        .replace_protein_scoped(staging, production, table)
                        .await?
                }
                MergeStrategy::Metadata => continue,
            };
            info!(table = table.name, rows, "merged staging into production");
        }

        if self.settings.obsolete_policy == ObsoletePolicy::Delete {
            let removed = self
                .adapter
                .delete_missing_proteins(staging, production)
                .await?;
            info!(removed, "removed proteins absent from the new release");
        }

        self.adapter.drop_schema(staging).await?;

        let release_record = self.build_release_record(release, &reports);
        MetadataRegistry::new(self.adapter, production)
            .record_release(&release_record)
            .await?;

        Ok(summarize(run, LoadMode::Delta, release, &reports, ingest))
    }

    /// Shared staging phase: fresh staging schema, transform every input
    /// to spool files, bulk load, then deduplicate across datasets.
    async fn stage(
        &self,
        staging: &str,
        spool_root: &std::path::Path,
        inputs: &[DatasetInput],
        cancel: &CancelToken,
    ) -> Result<(Vec<(Dataset, TransformReport)>, IngestReport)> {
        self.adapter.drop_schema(staging).await?;
        self.adapter.create_schema(staging).await?;
        self.adapter
            .apply_table_definitions(staging, schema::TABLES)
            .await?;

        let mut reports = Vec::with_capacity(inputs.len());
        let mut ingest = IngestReport::new();
        let executor = BulkLoadExecutor::new(self.adapter);

        for input in inputs {
            let report = self.transform_one(input, spool_root, cancel).await?;
            let spool_dir = spool_root.join(input.dataset.to_string());
            let loaded = executor.load_all(staging, &spool_dir).await?;
            for (table, rows) in loaded {
                *ingest.entry(table).or_insert(0) += rows;
            }
            reports.push((input.dataset, report));
        }

        for table in schema::data_tables() {
            let removed = self.adapter.deduplicate_staging(staging, table).await?;
            if removed > 0 {
                info!(table = table.name, removed, "deduplicated staged rows");
            }
        }

        Ok((reports, ingest))
    }

    async fn transform_one(
        &self,
        input: &DatasetInput,
        spool_root: &std::path::Path,
        cancel: &CancelToken,
    ) -> Result<TransformReport> {
        let options = TransformOptions {
            workers: self.settings.effective_workers(),
            queue_depth: self.settings.effective_queue_depth(),
            profile: self.settings.profile,
        };
        let path = input.path.clone();
        let spool_dir = spool_root.join(input.dataset.to_string());
        let cancel = cancel.clone();
        let report = tokio::task::spawn_blocking(move || {
            transform::transform_to_spool(&path, &spool_dir, &options, &cancel)
        })
        .await
        .map_err(|err| EtlError::TransformFailure(format!("transform task panicked: {err}")))??;

        info!(
            dataset = %input.dataset,
            entries = report.entries,
            skipped = report.skipped,
            "dataset transformed"
        );
        Ok(report)
    }

    async fn resolve_release(&self, inputs: &[DatasetInput]) -> Result<String> {
        if let Some(tag) = &self.settings.release_tag {
            return Ok(tag.clone());
        }
        let path = inputs[0].path.clone();
        let release = tokio::task::spawn_blocking(move || xml::peek_release(&path))
            .await
            .map_err(|err| EtlError::TransformFailure(format!("release probe panicked: {err}")))??;
        release.ok_or_else(|| {
            EtlError::Config(
                "input XML root carries no release attribute; set release_tag in settings".into(),
            )
        })
    }

    fn build_release_record(
        &self,
        release: &str,
        reports: &[(Dataset, TransformReport)],
    ) -> ReleaseRecord {
        ReleaseRecord {
            version: release.to_string(),
            release_date: self.settings.release_date,
            load_timestamp: Utc::now(),
            swissprot_entry_count: dataset_entries(reports, Dataset::Swissprot),
            trembl_entry_count: dataset_entries(reports, Dataset::Trembl),
        }
    }
}

/// `<production>_staging_<release_tag>`, with the tag coerced into a
/// valid identifier fragment.
pub fn staging_schema_name(production: &str, release: &str) -> String {
    let tag: String = release
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("{production}_staging_{tag}")
}

/// `<production>_archive_<timestamp>`.
pub fn archive_schema_name(production: &str) -> String {
    format!("{production}_archive_{}", Utc::now().format("%Y%m%d%H%M%S"))
}

fn dataset_entries(reports: &[(Dataset, TransformReport)], dataset: Dataset) -> i64 {
    reports
        .iter()
        .filter(|(d, _)| *d == dataset)
        .map(|(_, r)| r.entries as i64)
        .sum()
}

fn summarize(
    run: &RunRecord,
    mode: LoadMode,
    release: &str,
    reports: &[(Dataset, TransformReport)],
    tables: IngestReport,
) -> LoadSummary {
    LoadSummary {
        run_id: run.run_id,
        mode,
        release: release.to_string(),
        up_to_date: false,
        entries: reports.iter().map(|(_, r)| r.entries).sum(),
        skipped_entries: reports.iter().map(|(_, r)| r.skipped).sum(),
        tables,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_name_embeds_release_tag() {
        assert_eq!(
            staging_schema_name("uniprot_public", "2024_03"),
            "uniprot_public_staging_2024_03"
        );
        assert_eq!(
            staging_schema_name("uniprot_public", "2024-03.B"),
            "uniprot_public_staging_2024_03_b"
        );
    }

    #[test]
    fn archive_name_is_timestamped() {
        let name = archive_schema_name("uniprot_public");
        assert!(name.starts_with("uniprot_public_archive_"));
        let suffix = name.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 14);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }
}
