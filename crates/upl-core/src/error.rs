//! Error types for the UniProt load pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Closed error taxonomy for the pipeline.
///
/// Only [`EtlError::InvalidEntry`] is recoverable: the transform coordinator
/// counts and skips it. Every other variant aborts the run, drops the
/// staging schema and closes the `load_history` row as failed.
#[derive(Error, Debug)]
pub enum EtlError {
    /// A single malformed entry; counted and skipped
    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    /// Unrecoverable parse/transform error; aborts the coordinator
    #[error("transform failed: {0}")]
    TransformFailure(String),

    /// Bulk COPY into a staging table failed
    #[error("bulk ingest into '{table}' failed: {message}")]
    BulkIngestFailure { table: String, message: String },

    /// Primary-key or foreign-key violation reported during ingest or merge
    #[error("constraint violation on '{table}': {message}")]
    ConstraintViolation { table: String, message: String },

    /// The schema-rename transaction failed; production is untouched
    #[error("schema cutover failed: {0}")]
    CutoverFailure(String),

    /// Cannot reach the target database; fatal before any state mutation
    #[error("database unavailable: {0}")]
    AdapterUnavailable(String),

    /// Any other database-side failure outside bulk ingest and cutover
    #[error("database error: {0}")]
    Database(String),

    /// Invalid settings or run parameters
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was cancelled by an external signal
    #[error("run cancelled")]
    Cancelled,

    /// I/O errors from spool files and inputs
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    /// Whether the error is fatal for the run (everything except a
    /// skippable entry).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EtlError::InvalidEntry(_))
    }
}
