//! Quake Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the quake ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`QuakeError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//! - **Checksums**: SHA-256 digests recorded for every ingested file
//! - **Types**: timestamp helpers shared by the pipeline and the CLI
//!
//! # Example
//!
//! ```
//! use quake_common::checksum::sha256_hex;
//! use quake_common::types::{from_epoch_micros, to_epoch_micros};
//!
//! let digest = sha256_hex(br#"{"features":[]}"#);
//! assert_eq!(digest.len(), 64);
//!
//! let ts = from_epoch_micros(1_700_000_000_123_456)?;
//! assert_eq!(to_epoch_micros(ts), 1_700_000_000_123_456);
//! # Ok::<(), quake_common::QuakeError>(())
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{QuakeError, Result};
