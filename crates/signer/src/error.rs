//! Signer error types.

use thiserror::Error;

/// Key handling and signature errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("artifact is not signed")]
    Unsigned,

    #[error("no trusted key named '{0}'")]
    UnknownKey(String),

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid signature format: {0}")]
    InvalidSignature(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for signer operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
