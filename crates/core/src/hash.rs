//! Artifact hash sets and incremental hashing.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// The full set of digests recorded for every build, lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildHashes {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
}

impl BuildHashes {
    /// Compute all digests of an in-memory buffer.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Self::hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Create an incremental hasher.
    pub fn hasher() -> BuildHasher {
        BuildHasher::new()
    }

    /// Check the sha256 digest against an expected hex value.
    pub fn verify_sha256(&self, expected: &str) -> crate::Result<()> {
        check_digest(expected, &self.sha256)
    }

    /// Check every digest that the caller declares.
    ///
    /// `None` means the source did not publish that digest.
    pub fn verify_declared(
        &self,
        md5: Option<&str>,
        sha1: Option<&str>,
        sha512: Option<&str>,
    ) -> crate::Result<()> {
        if let Some(expected) = md5 {
            check_digest(expected, &self.md5)?;
        }
        if let Some(expected) = sha1 {
            check_digest(expected, &self.sha1)?;
        }
        if let Some(expected) = sha512 {
            check_digest(expected, &self.sha512)?;
        }
        Ok(())
    }
}

fn check_digest(expected: &str, actual: &str) -> crate::Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(crate::Error::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual: actual.to_string(),
        })
    }
}

/// Normalize a hex digest of `bytes` length to lowercase.
pub fn normalize_hex(s: &str, bytes: usize) -> crate::Result<String> {
    if s.len() != bytes * 2 {
        return Err(crate::Error::InvalidHash(format!(
            "expected {} hex chars, got {}",
            bytes * 2,
            s.len()
        )));
    }
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(crate::Error::InvalidHash(format!("not hex: {s}")));
    }
    Ok(s.to_ascii_lowercase())
}

/// Incremental hasher computing md5, sha1, sha256 and sha512 in one pass.
pub struct BuildHasher {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
    len: u64,
}

impl BuildHasher {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha512: Sha512::new(),
            len: 0,
        }
    }

    /// Update with more data.
    pub fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
        self.sha512.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finalize and return the hash set.
    pub fn finalize(self) -> BuildHashes {
        BuildHashes {
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
            sha512: hex::encode(self.sha512.finalize()),
        }
    }
}

impl Default for BuildHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BuildHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildHasher").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_digests() {
        let hashes = BuildHashes::compute(b"");
        assert_eq!(hashes.md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hashes.sha1, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(
            hashes.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hashes.sha512,
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
             47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = b"lineage nightly artifact payload";
        let mut hasher = BuildHashes::hasher();
        for chunk in data.chunks(5) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.len(), data.len() as u64);
        assert_eq!(hasher.finalize(), BuildHashes::compute(data));
    }

    #[test]
    fn test_verify_sha256_case_insensitive() {
        let hashes = BuildHashes::compute(b"abc");
        hashes
            .verify_sha256("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD")
            .unwrap();

        let err = hashes.verify_sha256(&"0".repeat(64)).unwrap_err();
        assert!(matches!(err, crate::Error::HashMismatch { .. }));
    }

    #[test]
    fn test_verify_declared_skips_missing() {
        let hashes = BuildHashes::compute(b"abc");
        hashes.verify_declared(None, None, None).unwrap();
        hashes
            .verify_declared(Some("900150983cd24fb0d6963f7d28e17f72"), None, None)
            .unwrap();
        assert!(hashes.verify_declared(None, Some("deadbeef"), None).is_err());
    }

    #[test]
    fn test_normalize_hex() {
        assert_eq!(normalize_hex("ABcd", 2).unwrap(), "abcd");
        assert!(normalize_hex("abc", 2).is_err());
        assert!(normalize_hex("zzzz", 2).is_err());
    }
}
