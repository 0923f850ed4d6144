//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, QuakeError>;

/// Errors raised by shared utilities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuakeError {
    /// Value cannot be represented as a UTC timestamp
    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(i64),
}
