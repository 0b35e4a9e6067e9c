//! Ed25519 keys and signatures in `name:base64` form.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;
use std::path::Path;

fn split_named(s: &str, what: &str) -> SignerResult<(String, Vec<u8>)> {
    let (name, b64) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| SignerError::KeyParsing(format!("expected 'name:base64' {what}")))?;
    if name.is_empty() {
        return Err(SignerError::KeyParsing(format!("{what} has an empty name")));
    }
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| SignerError::KeyParsing(format!("invalid base64 in {what}: {e}")))?;
    Ok((name.to_string(), bytes))
}

/// Private half of a signing key.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse `name:base64(secret || public)`.
    pub fn parse(s: &str) -> SignerResult<(String, Self)> {
        let (name, bytes) = split_named(s, "secret key")?;
        let secret: [u8; 32] = bytes
            .get(..32)
            .filter(|_| bytes.len() == 64)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                SignerError::KeyParsing(format!("expected 64 key bytes, got {}", bytes.len()))
            })?;
        Ok((
            name,
            Self {
                inner: SigningKey::from_bytes(&secret),
            },
        ))
    }

    pub fn encode(&self, name: &str) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.inner.as_bytes());
        bytes.extend_from_slice(self.inner.verifying_key().as_bytes());
        format!("{name}:{}", STANDARD.encode(&bytes))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Public half of a signing key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse `name:base64(public)`.
    pub fn parse(s: &str) -> SignerResult<(String, Self)> {
        let (name, bytes) = split_named(s, "public key")?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            SignerError::KeyParsing(format!("expected 32 key bytes, got {}", bytes.len()))
        })?;
        let inner = VerifyingKey::from_bytes(&key)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;
        Ok((name, Self { inner }))
    }

    /// Read a key file holding a single `name:base64` line.
    pub fn from_file(path: impl AsRef<Path>) -> SignerResult<(String, Self)> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn encode(&self, name: &str) -> String {
        format!("{name}:{}", STANDARD.encode(self.inner.as_bytes()))
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = STANDARD.encode(self.inner.as_bytes());
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

/// A named secret key with its public key.
pub struct KeyPair {
    /// Key name, e.g. `lineageos-1`.
    pub name: String,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate(name: impl Into<String>) -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self {
            name: name.into(),
            secret,
            public,
        }
    }

    pub fn from_secret_key(s: &str) -> SignerResult<Self> {
        let (name, secret) = SecretKey::parse(s)?;
        let public = secret.public_key();
        Ok(Self {
            name,
            secret,
            public,
        })
    }

    pub fn secret_key_string(&self) -> String {
        self.secret.encode(&self.name)
    }

    pub fn public_key_string(&self) -> String {
        self.public.encode(&self.name)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("public", &self.public)
            .finish()
    }
}

/// A detached signature as published in a manifest: `keyname:base64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSignature {
    pub key_name: String,
    pub bytes: [u8; 64],
}

impl ArtifactSignature {
    pub fn parse(s: &str) -> SignerResult<Self> {
        let (key_name, b64) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| SignerError::InvalidSignature("expected 'keyname:base64'".into()))?;
        let raw = STANDARD
            .decode(b64)
            .map_err(|e| SignerError::InvalidSignature(format!("invalid base64: {e}")))?;
        let bytes: [u8; 64] = raw.as_slice().try_into().map_err(|_| {
            SignerError::InvalidSignature(format!("expected 64 bytes, got {}", raw.len()))
        })?;
        Ok(Self {
            key_name: key_name.to_string(),
            bytes,
        })
    }
}

impl fmt::Display for ArtifactSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_name, STANDARD.encode(self.bytes))
    }
}
