//! Fingerprint signing and verification.

use crate::error::{SignerError, SignerResult};
use crate::key::{ArtifactSignature, KeyPair, PublicKey};
use ed25519_dalek::{Signer as _, Verifier as _};

/// Signs artifact fingerprints. Used by tooling and tests to produce
/// manifests the mirror will accept.
pub struct ArtifactSigner {
    keypair: KeyPair,
}

impl ArtifactSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    pub fn generate(key_name: impl Into<String>) -> Self {
        Self::new(KeyPair::generate(key_name))
    }

    pub fn key_name(&self) -> &str {
        &self.keypair.name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    pub fn public_key_string(&self) -> String {
        self.keypair.public_key_string()
    }

    pub fn sign_fingerprint(&self, fingerprint: &str) -> ArtifactSignature {
        let sig = self
            .keypair
            .secret
            .signing_key()
            .sign(fingerprint.as_bytes());
        ArtifactSignature {
            key_name: self.keypair.name.clone(),
            bytes: sig.to_bytes(),
        }
    }
}

/// Checks a detached signature over an artifact fingerprint.
pub trait SignatureVerifier: Send + Sync {
    /// `signature` is the raw `keyname:base64` string, `None` when the
    /// artifact carries none. Unsigned artifacts never verify.
    fn verify(&self, fingerprint: &str, signature: Option<&str>) -> SignerResult<()>;
}

/// Verifies against a fixed set of named public keys.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeyVerifier {
    keys: Vec<(String, PublicKey)>,
}

impl TrustedKeyVerifier {
    pub fn new(keys: Vec<(String, PublicKey)>) -> Self {
        Self { keys }
    }

    /// Trust a single `name:base64` public key.
    pub fn from_public_key(s: &str) -> SignerResult<Self> {
        Ok(Self::new(vec![PublicKey::parse(s)?]))
    }

    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(name, _)| name.as_str())
    }
}

impl SignatureVerifier for TrustedKeyVerifier {
    fn verify(&self, fingerprint: &str, signature: Option<&str>) -> SignerResult<()> {
        let signature = ArtifactSignature::parse(signature.ok_or(SignerError::Unsigned)?)?;

        let (_, key) = self
            .keys
            .iter()
            .find(|(name, _)| *name == signature.key_name)
            .ok_or_else(|| SignerError::UnknownKey(signature.key_name.clone()))?;

        key.verifying_key()
            .verify(
                fingerprint.as_bytes(),
                &ed25519_dalek::Signature::from_bytes(&signature.bytes),
            )
            .map_err(|_| SignerError::VerificationFailed)
    }
}
