//! PostgreSQL adapter
//!
//! Reference implementation of the pipeline's database contract. Bulk
//! ingest streams spool files through the native `COPY ... FROM STDIN`
//! protocol; the full-load cutover is two `ALTER SCHEMA ... RENAME`
//! statements plus the release bookkeeping inside one transaction, so no
//! reader of the production name ever observes an intermediate state.
//!
//! Schema and table names are interpolated into SQL. They come from the
//! static catalog and from settings validated by the core, never from
//! data.

use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use sqlx::postgres::{PgPoolCopyExt, PgPoolOptions};
use sqlx::{Executor, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use upl_core::adapter::{DatabaseAdapter, ReleaseRecord, RunRecord, RunStatus};
use upl_core::error::{EtlError, Result};
use upl_core::schema::{TableDef, LOAD_HISTORY, PROTEINS, RELEASE_METADATA};
use upl_core::Settings;

/// Bytes handed to the COPY stream per chunk.
const COPY_CHUNK_BYTES: usize = 1 << 20;

pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Connect to the database described by the settings. Fails fast with
    /// [`EtlError::AdapterUnavailable`] when the server is unreachable.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let mut options = PgPoolOptions::new().max_connections(8);
        if let Some(secs) = settings.statement_timeout_secs {
            options = options.after_connect(move |conn, _meta| {
                Box::pin(async move {
                    let stmt = format!("SET statement_timeout = '{secs}s'");
                    conn.execute(stmt.as_str()).await?;
                    Ok(())
                })
            });
        }
        let pool = options
            .connect(&settings.database_url)
            .await
            .map_err(|err| EtlError::AdapterUnavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        debug!(sql, "executing");
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

fn db_error(err: sqlx::Error) -> EtlError {
    EtlError::Database(err.to_string())
}

/// Constraint violations (SQLSTATE class 23) get their own variant so the
/// failure report names the broken key rather than a generic COPY error.
fn ingest_error(table: &str, err: sqlx::Error) -> EtlError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().is_some_and(|code| code.starts_with("23")) {
            return EtlError::ConstraintViolation {
                table: table.to_string(),
                message: db.message().to_string(),
            };
        }
    }
    EtlError::BulkIngestFailure {
        table: table.to_string(),
        message: err.to_string(),
    }
}

/// Missing schema or table reads as "nothing loaded yet".
fn is_missing_relation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        return db
            .code()
            .is_some_and(|code| code == "42P01" || code == "3F000");
    }
    false
}

fn copy_statement(schema: &str, table: &TableDef) -> String {
    let columns: Vec<&str> = table.column_names().collect();
    format!(
        "COPY {schema}.{} ({}) FROM STDIN WITH (FORMAT text)",
        table.name,
        columns.join(", ")
    )
}

fn upsert_statement(staging: &str, production: &str, table: &TableDef) -> String {
    let columns: Vec<&str> = table.column_names().collect();
    let columns = columns.join(", ");
    let conflict = table.primary_key.join(", ");
    let updates: Vec<String> = table
        .non_key_columns()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {production}.{table} ({columns}) SELECT {columns} FROM {staging}.{table} \
         ON CONFLICT ({conflict}) {action}",
        table = table.name
    )
}

fn dedup_statement(schema: &str, table: &TableDef) -> String {
    let matches: Vec<String> = table
        .primary_key
        .iter()
        .map(|key| format!("a.{key} = b.{key}"))
        .collect();
    format!(
        "DELETE FROM {schema}.{table} AS a USING {schema}.{table} AS b \
         WHERE a.ctid < b.ctid AND {}",
        matches.join(" AND "),
        table = table.name
    )
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn ensure_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| EtlError::AdapterUnavailable(err.to_string()))?;
        Ok(())
    }

    async fn create_schema(&self, schema: &str) -> Result<()> {
        self.execute(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .await?;
        Ok(())
    }

    async fn drop_schema(&self, schema: &str) -> Result<()> {
        self.execute(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .await?;
        Ok(())
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM pg_namespace WHERE nspname = $1")
            .bind(schema)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.is_some())
    }

    async fn apply_table_definitions(&self, schema: &str, catalog: &[TableDef]) -> Result<()> {
        for table in catalog {
            self.execute(&table.create_sql(schema)).await?;
        }
        debug!(schema, tables = catalog.len(), "table definitions applied");
        Ok(())
    }

    async fn bulk_ingest(&self, schema: &str, table: &TableDef, spool: &Path) -> Result<u64> {
        let statement = copy_statement(schema, table);
        debug!(table = table.name, spool = %spool.display(), "starting COPY");

        let file = std::fs::File::open(spool)?;
        let mut copy = self
            .pool
            .copy_in_raw(&statement)
            .await
            .map_err(|err| ingest_error(table.name, err))?;

        // Decompression is synchronous; a blocking task feeds chunks to
        // the async COPY sink through a small bounded channel.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<std::io::Result<Vec<u8>>>(4);
        let reader = tokio::task::spawn_blocking(move || {
            let mut decoder = GzDecoder::new(file);
            let mut buf = vec![0u8; COPY_CHUNK_BYTES];
            loop {
                match decoder.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        break;
                    }
                }
            }
        });

        let mut failure: Option<EtlError> = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(bytes) => {
                    if let Err(err) = copy.send(bytes).await {
                        failure = Some(ingest_error(table.name, err));
                        break;
                    }
                }
                Err(err) => {
                    failure = Some(EtlError::Io(err));
                    break;
                }
            }
        }
        drop(rx);
        let _ = reader.await;

        if let Some(err) = failure {
            let _ = copy.abort("spool ingest failed").await;
            return Err(err);
        }
        let rows = copy
            .finish()
            .await
            .map_err(|err| ingest_error(table.name, err))?;
        info!(table = table.name, rows, "COPY finished");
        Ok(rows)
    }

    async fn create_indexes(&self, schema: &str, catalog: &[TableDef]) -> Result<()> {
        for table in catalog {
            for sql in table.index_sql(schema) {
                self.execute(&sql).await?;
            }
        }
        info!(schema, "post-load indexes created");
        Ok(())
    }

    async fn analyze_schema(&self, schema: &str) -> Result<()> {
        for table in catalog_names(schema).iter() {
            self.execute(&format!("ANALYZE {table}")).await?;
        }
        Ok(())
    }

    async fn rename_schema(&self, from: &str, to: &str) -> Result<()> {
        self.execute(&format!("ALTER SCHEMA {from} RENAME TO {to}"))
            .await?;
        Ok(())
    }

    async fn commit_schema_swap(
        &self,
        production: &str,
        staging: &str,
        archive: &str,
        release: &ReleaseRecord,
    ) -> Result<()> {
        let cutover = |err: sqlx::Error| EtlError::CutoverFailure(err.to_string());

        let mut tx = self.pool.begin().await.map_err(cutover)?;
        let production_exists = sqlx::query("SELECT 1 FROM pg_namespace WHERE nspname = $1")
            .bind(production)
            .fetch_optional(&mut *tx)
            .await
            .map_err(cutover)?
            .is_some();
        if production_exists {
            sqlx::query(&format!("ALTER SCHEMA {production} RENAME TO {archive}"))
                .execute(&mut *tx)
                .await
                .map_err(cutover)?;
        }
        sqlx::query(&format!("ALTER SCHEMA {staging} RENAME TO {production}"))
            .execute(&mut *tx)
            .await
            .map_err(cutover)?;
        sqlx::query(&format!(
            "INSERT INTO {production}.{RELEASE_METADATA} \
             (version, release_date, load_timestamp, swissprot_entry_count, trembl_entry_count) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (version) DO UPDATE SET \
             release_date = EXCLUDED.release_date, \
             load_timestamp = EXCLUDED.load_timestamp, \
             swissprot_entry_count = EXCLUDED.swissprot_entry_count, \
             trembl_entry_count = EXCLUDED.trembl_entry_count"
        ))
        .bind(&release.version)
        .bind(release.release_date)
        .bind(release.load_timestamp)
        .bind(release.swissprot_entry_count)
        .bind(release.trembl_entry_count)
        .execute(&mut *tx)
        .await
        .map_err(cutover)?;
        tx.commit().await.map_err(cutover)?;

        info!(%production, %staging, %archive, "schema swap committed");
        Ok(())
    }

    async fn upsert_from_staging(
        &self,
        staging: &str,
        production: &str,
        table: &TableDef,
    ) -> Result<u64> {
        self.execute(&upsert_statement(staging, production, table))
            .await
    }

    async fn replace_protein_scoped(
        &self,
        staging: &str,
        production: &str,
        table: &TableDef,
    ) -> Result<u64> {
        let protein_column = table.primary_key[0];
        let columns: Vec<&str> = table.column_names().collect();
        let columns = columns.join(", ");

        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query(&format!(
            "DELETE FROM {production}.{table} WHERE {protein_column} IN \
             (SELECT primary_accession FROM {staging}.{PROTEINS})",
            table = table.name
        ))
        .execute(&mut *tx)
        .await
        .map_err(|err| ingest_error(table.name, err))?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO {production}.{table} ({columns}) SELECT {columns} FROM {staging}.{table}",
            table = table.name
        ))
        .execute(&mut *tx)
        .await
        .map_err(|err| ingest_error(table.name, err))?
        .rows_affected();
        tx.commit().await.map_err(db_error)?;
        Ok(inserted)
    }

    async fn delete_missing_proteins(&self, staging: &str, production: &str) -> Result<u64> {
        self.execute(&format!(
            "DELETE FROM {production}.{PROTEINS} AS prod WHERE NOT EXISTS \
             (SELECT 1 FROM {staging}.{PROTEINS} AS stage \
              WHERE stage.primary_accession = prod.primary_accession)"
        ))
        .await
    }

    async fn deduplicate_staging(&self, schema: &str, table: &TableDef) -> Result<u64> {
        self.execute(&dedup_statement(schema, table)).await
    }

    async fn current_release(&self, schema: &str) -> Result<Option<ReleaseRecord>> {
        let sql = format!(
            "SELECT version, release_date, load_timestamp, swissprot_entry_count, trembl_entry_count \
             FROM {schema}.{RELEASE_METADATA} ORDER BY load_timestamp DESC LIMIT 1"
        );
        match sqlx::query(&sql).fetch_optional(&self.pool).await {
            Ok(Some(row)) => Ok(Some(ReleaseRecord {
                version: row.get("version"),
                release_date: row.get("release_date"),
                load_timestamp: row.get("load_timestamp"),
                swissprot_entry_count: row.get("swissprot_entry_count"),
                trembl_entry_count: row.get("trembl_entry_count"),
            })),
            Ok(None) => Ok(None),
            Err(err) if is_missing_relation(&err) => {
                debug!(schema, "no metadata table yet, treating as unloaded");
                Ok(None)
            }
            Err(err) => Err(db_error(err)),
        }
    }

    async fn write_release(&self, schema: &str, release: &ReleaseRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {schema}.{RELEASE_METADATA} \
             (version, release_date, load_timestamp, swissprot_entry_count, trembl_entry_count) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (version) DO UPDATE SET \
             release_date = EXCLUDED.release_date, \
             load_timestamp = EXCLUDED.load_timestamp, \
             swissprot_entry_count = EXCLUDED.swissprot_entry_count, \
             trembl_entry_count = EXCLUDED.trembl_entry_count"
        ))
        .bind(&release.version)
        .bind(release.release_date)
        .bind(release.load_timestamp)
        .bind(release.swissprot_entry_count)
        .bind(release.trembl_entry_count)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn insert_run(&self, schema: &str, run: &RunRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {schema}.{LOAD_HISTORY} (run_id, status, mode, dataset, start_time) \
             VALUES ($1, $2, $3, $4, $5)"
        ))
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.mode.to_string())
        .bind(run.dataset.to_string())
        .bind(run.start_time)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn finish_run(
        &self,
        schema: &str,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        // After a full-load cutover the running row lives in the archived
        // schema, so closing the run inserts into the fresh history table.
        let result = sqlx::query(&format!(
            "INSERT INTO {schema}.{LOAD_HISTORY} (run_id, status, end_time, error_message) \
             VALUES ($1, $2, now(), $3) \
             ON CONFLICT (run_id) DO UPDATE SET \
             status = EXCLUDED.status, \
             end_time = EXCLUDED.end_time, \
             error_message = EXCLUDED.error_message"
        ))
        .bind(run_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            warn!(%run_id, error = %err, "failed to record run completion");
            return Err(db_error(err));
        }
        Ok(())
    }
}

fn catalog_names(schema: &str) -> Vec<String> {
    upl_core::schema::TABLES
        .iter()
        .map(|t| format!("{schema}.{}", t.name))
        .collect()
}
