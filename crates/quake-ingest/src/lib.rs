//! Quake Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental ingestion of earthquake GeoJSON documents into a deduplicated,
//! latest-version event table.
//!
//! # Pipeline
//!
//! - **Discovery**: [`source::DocumentSource`] lists landing files; the
//!   [`ledger::FileLedger`] filters out paths already consumed
//! - **Validation**: [`document::parse_document`] checks document structure and
//!   reads every declared property as text
//! - **Flattening**: [`flatten::flatten_document`] produces one typed
//!   [`models::FlatEventRecord`] per feature
//! - **Merge**: [`storage::EventStore::apply_batch`] keeps the record with the
//!   greatest `_load_ts` per `id` and records the batch's files, in one
//!   transaction
//!
//! # Example
//!
//! ```no_run
//! use quake_ingest::config::IngestConfig;
//! use quake_ingest::pipeline::Pipeline;
//! use quake_ingest::source::LocalDirSource;
//! use quake_ingest::storage::EventStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig {
//!         namespace: "main".to_string(),
//!         ..IngestConfig::default()
//!     };
//!     config.validate()?;
//!
//!     let store = EventStore::connect(&config.database_url).await?;
//!     let source = Arc::new(LocalDirSource::new(config.input_path()));
//!     let pipeline = Pipeline::new(source, store, config).await?;
//!
//!     let report = pipeline.run_cycle().await?;
//!     println!("{} records merged", report.records_emitted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod flatten;
pub mod ledger;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod source;
pub mod storage;

pub use error::{IngestError, Result};
pub use models::{FlatEventRecord, LedgerEntry};
pub use pipeline::{CycleReport, Pipeline};
