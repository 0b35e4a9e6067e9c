//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Transport-level failures worth retrying. Missing objects and bad
    /// keys or configuration will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::S3(_))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
