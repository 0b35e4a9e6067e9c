//! Pipeline error types.

use mirror_metadata::MetadataError;
use mirror_signer::SignerError;
use mirror_storage::StorageError;
use thiserror::Error;

/// Errors raised while fetching, verifying and retaining builds.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or HTTP failure talking to upstream. Scoped to one device
    /// or artifact; the sweep carries on.
    #[error("upstream unavailable at {url}: {reason}")]
    UpstreamUnavailable { url: String, reason: String },

    #[error("malformed manifest: {0}")]
    ManifestMalformed(String),

    #[error("size mismatch for {filename}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        filename: String,
        expected: u64,
        actual: u64,
    },

    #[error("hash mismatch for {filename}: expected {expected}, got {actual}")]
    HashMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("signature invalid for {filename}: {reason}")]
    SignatureInvalid { filename: String, reason: String },

    #[error("no trusted key configured; refusing to store unverified builds")]
    NoTrustedKey,

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("key error: {0}")]
    Key(#[from] SignerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub(crate) fn upstream(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnavailable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Download attempts that may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::SizeMismatch { .. } | Self::HashMismatch { .. }
        )
    }
}

impl From<mirror_core::Error> for PipelineError {
    fn from(err: mirror_core::Error) -> Self {
        match err {
            mirror_core::Error::ManifestMalformed(msg) => Self::ManifestMalformed(msg),
            other => Self::InvalidArtifact(other.to_string()),
        }
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
