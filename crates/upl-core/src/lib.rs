//! upl-core: streaming UniProtKB transform and load pipeline
//!
//! Ingests the UniProt Knowledgebase XML corpora and materializes them
//! into a relational store with a stable schema. The heavy lifting is a
//! memory-bounded streaming XML parser fanned out over CPU workers that
//! spool COPY-ready rows per table, plus two load strategies on top: an
//! atomic schema swap for full rebuilds and a stage-then-merge path for
//! incremental releases.
//!
//! The crate is database-agnostic: everything reaches the target store
//! through the [`adapter::DatabaseAdapter`] capability trait. The
//! reference PostgreSQL implementation lives in `upl-postgres`.

pub mod adapter;
pub mod bulk;
pub mod config;
pub mod director;
pub mod encode;
pub mod error;
pub mod metadata;
pub mod model;
pub mod pipeline;
pub mod schema;
pub mod transform;
pub mod xml;

pub use adapter::{DatabaseAdapter, ReleaseRecord, RunRecord, RunStatus};
pub use config::{ObsoletePolicy, Settings};
pub use director::{DatasetInput, LoadSummary};
pub use error::{EtlError, Result};
pub use model::{Dataset, Entry, LoadMode, Profile, XmlNode};
pub use pipeline::UniprotPipeline;
pub use transform::{CancelToken, TransformOptions, TransformReport};
