//! Ed25519 signatures over build artifact fingerprints.
//!
//! Upstream signs `1;{filename};{sha256};{size}` for every published
//! artifact. This crate parses keys and signatures in `name:base64` form
//! and verifies fingerprints against a set of trusted public keys.

pub mod error;
pub mod key;
pub mod verify;

pub use error::{SignerError, SignerResult};
pub use key::{ArtifactSignature, KeyPair, PublicKey, SecretKey};
pub use verify::{ArtifactSigner, SignatureVerifier, TrustedKeyVerifier};
