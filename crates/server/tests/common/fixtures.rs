//! Test data fixtures.

use mirror_core::BuildHashes;
use mirror_metadata::{BuildUpsert, Patch};

/// Signed artifact filename for `oneplus3` 20.0 built on `date`.
#[allow(dead_code)]
pub fn build_filename(date: &str) -> String {
    format!("lineage-20.0-{date}-nightly-oneplus3-signed.zip")
}

/// Deterministic artifact content of `len` bytes.
#[allow(dead_code)]
pub fn artifact_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Upsert for a `oneplus3`/`20.0` build with the given storage state.
#[allow(dead_code)]
pub fn build_upsert(
    filename: &str,
    date: &str,
    content: &[u8],
    local_path: Option<String>,
    remote_url: Option<String>,
) -> BuildUpsert {
    let patch = |value: Option<String>| value.map(Patch::Set).unwrap_or(Patch::Keep);
    BuildUpsert {
        filename: filename.to_string(),
        device: "oneplus3".to_string(),
        version: "20.0".to_string(),
        date: date.to_string(),
        size: content.len() as u64,
        hashes: BuildHashes::compute(content),
        signature_valid: true,
        available_upstream: Some(true),
        local_path: patch(local_path),
        remote_url: patch(remote_url),
    }
}
