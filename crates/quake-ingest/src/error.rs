//! Error types for the ingestion pipeline
//!
//! Only batch-level failures travel up to the loop. Per-document parse errors
//! are caught by the pipeline and turned into a `rejected` ledger entry, and
//! per-field coercion problems are not errors at all (see
//! [`crate::models::CoercionWarning`]).

use quake_common::QuakeError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed document structure; `path` is a JSON path such as `$.features`
    #[error("Parse error at {path}: {message}")]
    Parse { path: String, message: String },

    /// Persistence layer failed; nothing from the batch was committed
    #[error("Storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    /// A single input file could not be read
    #[error("Failed to read '{path}': {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery did not finish within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Configuration error: {0}. Check QUAKE_* environment variables or CLI flags.")]
    Config(String),

    #[error(transparent)]
    Common(#[from] QuakeError),
}

impl IngestError {
    /// Create a parse error anchored at a JSON path
    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the whole cycle should be attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Storage(_) | IngestError::DiscoveryTimeout(_) | IngestError::Worker(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IngestError::Storage(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(IngestError::DiscoveryTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!IngestError::parse("$", "bad").is_retryable());
        assert!(!IngestError::config("missing namespace").is_retryable());
    }

    #[test]
    fn test_parse_error_names_path() {
        let err = IngestError::parse("$.features", "expected an array");
        assert_eq!(err.to_string(), "Parse error at $.features: expected an array");
    }
}
