//! Download-and-verify for manifest entries.
//!
//! Bytes are streamed into a staged upload on the local store and hashed
//! on the way. The staged upload is only handed back once size, hashes
//! and signature all check out; on any failure it is aborted so nothing
//! becomes visible.

use crate::error::{PipelineError, PipelineResult};
use bytes::Bytes;
use futures::StreamExt;
use mirror_core::config::{TrustedKeyConfig, UpstreamConfig};
use mirror_core::{BuildHashes, DOWNLOAD_CHUNK_SIZE, ManifestEntry};
use mirror_signer::{PublicKey, SignatureVerifier, TrustedKeyVerifier};
use mirror_storage::{ObjectStore, StreamingUpload};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Bytes that passed verification, staged but not yet committed.
pub struct Verified {
    key: String,
    hashes: BuildHashes,
    size: u64,
    signature_valid: bool,
    upload: Box<dyn StreamingUpload>,
}

impl Verified {
    pub(crate) fn new(
        key: String,
        hashes: BuildHashes,
        size: u64,
        signature_valid: bool,
        upload: Box<dyn StreamingUpload>,
    ) -> Self {
        Self {
            key,
            hashes,
            size,
            signature_valid,
            upload,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn hashes(&self) -> &BuildHashes {
        &self.hashes
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn signature_valid(&self) -> bool {
        self.signature_valid
    }

    pub(crate) fn into_upload(self) -> Box<dyn StreamingUpload> {
        self.upload
    }
}

impl fmt::Debug for Verified {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verified")
            .field("key", &self.key)
            .field("sha256", &self.hashes.sha256)
            .field("size", &self.size)
            .finish()
    }
}

/// Build the signature verifier for the configured trusted key.
pub fn load_trusted_key(config: &UpstreamConfig) -> PipelineResult<Arc<dyn SignatureVerifier>> {
    let key = match config.trusted_key.as_ref().ok_or(PipelineError::NoTrustedKey)? {
        TrustedKeyConfig::File { path } => PublicKey::from_file(path)?,
        TrustedKeyConfig::Value { key } => PublicKey::parse(key)?,
    };
    tracing::info!(key_name = %key.0, "Loaded trusted signing key");
    Ok(Arc::new(TrustedKeyVerifier::new(vec![key])))
}

pub(crate) async fn abort_quietly(upload: Box<dyn StreamingUpload>, key: &str) {
    if let Err(e) = upload.abort().await {
        tracing::warn!(key = %key, error = %e, "Failed to discard staged upload");
    }
}

/// Downloads artifacts and confirms size, hashes and signature.
pub struct IntegrityVerifier {
    client: reqwest::Client,
    signatures: Arc<dyn SignatureVerifier>,
    attempts: u32,
}

impl IntegrityVerifier {
    pub fn new(
        client: reqwest::Client,
        signatures: Arc<dyn SignatureVerifier>,
        attempts: u32,
    ) -> Self {
        Self {
            client,
            signatures,
            attempts: attempts.max(1),
        }
    }

    /// Download `entry` into a staged upload under `key` and verify it.
    ///
    /// Size and hash mismatches are retried up to the configured number of
    /// attempts. An invalid signature is final.
    #[instrument(skip(self, entry, staging, cancel), fields(filename = %entry.filename))]
    pub async fn verify(
        &self,
        entry: &ManifestEntry,
        key: &str,
        staging: &dyn ObjectStore,
        cancel: &CancellationToken,
    ) -> PipelineResult<Verified> {
        let mut attempt = 1;
        let (upload, hashes) = loop {
            match self.download_once(entry, key, staging, cancel).await {
                Ok(done) => break done,
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    tracing::warn!(attempt, error = %e, "Download failed verification, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        if let Err(e) = self
            .signatures
            .verify(&entry.fingerprint(), entry.signature.as_deref())
        {
            abort_quietly(upload, key).await;
            return Err(PipelineError::SignatureInvalid {
                filename: entry.filename.clone(),
                reason: e.to_string(),
            });
        }

        Ok(Verified::new(key.to_string(), hashes, entry.size, true, upload))
    }

    async fn download_once(
        &self,
        entry: &ManifestEntry,
        key: &str,
        staging: &dyn ObjectStore,
        cancel: &CancellationToken,
    ) -> PipelineResult<(Box<dyn StreamingUpload>, BuildHashes)> {
        let response = self
            .client
            .get(&entry.url)
            .send()
            .await
            .map_err(|e| PipelineError::upstream(&entry.url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::upstream(&entry.url, format!("HTTP {status}")));
        }

        let mut upload = staging.put_stream(key).await?;
        let mut hasher = BuildHashes::hasher();
        let mut body = response.bytes_stream();

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(PipelineError::Cancelled),
                next = body.next() => next,
            };
            let chunk: Bytes = match next {
                None => break Ok(()),
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => break Err(PipelineError::upstream(&entry.url, e)),
            };

            if let Err(e) = write_chunks(&mut *upload, &mut hasher, chunk).await {
                break Err(e);
            }
            if hasher.len() > entry.size {
                break Err(size_mismatch(entry, hasher.len()));
            }
        };

        let checked = result.and_then(|()| {
            if hasher.len() != entry.size {
                return Err(size_mismatch(entry, hasher.len()));
            }
            let hashes = hasher.finalize();
            hashes
                .verify_sha256(&entry.sha256)
                .and_then(|()| {
                    hashes.verify_declared(
                        entry.md5.as_deref(),
                        entry.sha1.as_deref(),
                        entry.sha512.as_deref(),
                    )
                })
                .map_err(|e| match e {
                    mirror_core::Error::HashMismatch { expected, actual } => {
                        PipelineError::HashMismatch {
                            filename: entry.filename.clone(),
                            expected,
                            actual,
                        }
                    }
                    other => PipelineError::from(other),
                })?;
            Ok(hashes)
        });

        match checked {
            Ok(hashes) => Ok((upload, hashes)),
            Err(e) => {
                abort_quietly(upload, key).await;
                Err(e)
            }
        }
    }
}

fn size_mismatch(entry: &ManifestEntry, actual: u64) -> PipelineError {
    PipelineError::SizeMismatch {
        filename: entry.filename.clone(),
        expected: entry.size,
        actual,
    }
}

/// Feed a network chunk through the hasher and staged upload in
/// `DOWNLOAD_CHUNK_SIZE` pieces.
pub(crate) async fn write_chunks(
    upload: &mut dyn StreamingUpload,
    hasher: &mut mirror_core::BuildHasher,
    chunk: Bytes,
) -> PipelineResult<()> {
    let mut offset = 0;
    while offset < chunk.len() {
        let end = (offset + DOWNLOAD_CHUNK_SIZE).min(chunk.len());
        let piece = chunk.slice(offset..end);
        hasher.update(&piece);
        upload.write(piece).await?;
        offset = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use mirror_signer::ArtifactSigner;
    use mirror_storage::FilesystemBackend;

    /// Test-only helper: read a whole object via `get_stream`.
    trait GetExt {
        async fn get(&self, key: &str) -> mirror_storage::StorageResult<Bytes>;
    }

    impl GetExt for FilesystemBackend {
        async fn get(&self, key: &str) -> mirror_storage::StorageResult<Bytes> {
            let mut stream = self.get_stream(key).await?;
            let mut out = Vec::new();
            while let Some(chunk) = stream.next().await {
                out.extend_from_slice(&chunk?);
            }
            Ok(Bytes::from(out))
        }
    }

    const FILENAME: &str = "lineage-20.0-20240101-nightly-oneplus3-signed.zip";
    const KEY: &str = "oneplus3/20.0/lineage-20.0-20240101-nightly-oneplus3-signed.zip";

    struct Fixture {
        server: MockServer,
        signer: ArtifactSigner,
        store: FilesystemBackend,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        Fixture {
            server: MockServer::start_async().await,
            signer: ArtifactSigner::generate("lineageos-1"),
            store: FilesystemBackend::new(dir.path()).await.unwrap(),
            _dir: dir,
        }
    }

    impl Fixture {
        fn entry(&self, content: &[u8]) -> ManifestEntry {
            let hashes = BuildHashes::compute(content);
            let mut entry = ManifestEntry {
                filename: FILENAME.to_string(),
                size: content.len() as u64,
                datetime: 1704067200,
                version: "20.0".to_string(),
                url: self.server.url("/artifact.zip"),
                sha256: hashes.sha256,
                romtype: Some("nightly".to_string()),
                signature: None,
                md5: None,
                sha1: None,
                sha512: None,
            };
            entry.signature = Some(self.signer.sign_fingerprint(&entry.fingerprint()).to_string());
            entry
        }

        /// Every regular file under the root, staged temporaries included.
        fn files_on_disk(&self) -> usize {
            fn walk(dir: &std::path::Path) -> usize {
                std::fs::read_dir(dir)
                    .unwrap()
                    .map(|e| e.unwrap().path())
                    .map(|p| if p.is_dir() { walk(&p) } else { 1 })
                    .sum()
            }
            walk(self.store.root())
        }

        fn verifier(&self, attempts: u32) -> IntegrityVerifier {
            let trusted = TrustedKeyVerifier::from_public_key(&self.signer.public_key_string())
                .unwrap();
            IntegrityVerifier::new(reqwest::Client::new(), Arc::new(trusted), attempts)
        }
    }

    #[tokio::test]
    async fn test_verified_download_commits_on_finish() {
        let fx = fixture().await;
        let content = vec![42u8; DOWNLOAD_CHUNK_SIZE * 2 + 17];
        fx.server
            .mock_async(|when, then| {
                when.method(GET).path("/artifact.zip");
                then.status(200).body(content.clone());
            })
            .await;

        let entry = fx.entry(&content);
        let verified = fx
            .verifier(1)
            .verify(&entry, KEY, &fx.store, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(verified.size(), content.len() as u64);
        assert_eq!(verified.hashes(), &BuildHashes::compute(&content));
        assert!(!fx.store.exists(KEY).await.unwrap(), "staged bytes are invisible");

        verified.into_upload().finish().await.unwrap();
        assert_eq!(fx.store.get(KEY).await.unwrap().as_ref(), content.as_slice());
    }

    #[tokio::test]
    async fn test_hash_mismatch_retries_then_fails() {
        let fx = fixture().await;
        let mock = fx
            .server
            .mock_async(|when, then| {
                when.method(GET).path("/artifact.zip");
                then.status(200).body("corrupted!");
            })
            .await;

        let entry = fx.entry(b"original!!");
        let err = fx
            .verifier(2)
            .verify(&entry, KEY, &fx.store, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::HashMismatch { .. }));
        mock.assert_hits_async(2).await;
        assert_eq!(fx.files_on_disk(), 0);
    }

    #[tokio::test]
    async fn test_truncated_download_is_size_mismatch() {
        let fx = fixture().await;
        fx.server
            .mock_async(|when, then| {
                when.path("/artifact.zip");
                then.status(200).body("short");
            })
            .await;

        let entry = fx.entry(b"much longer content");
        let err = fx
            .verifier(1)
            .verify(&entry, KEY, &fx.store, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SizeMismatch { expected: 19, actual: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_bad_signature_is_not_retried() {
        let fx = fixture().await;
        let mock = fx
            .server
            .mock_async(|when, then| {
                when.path("/artifact.zip");
                then.status(200).body("payload");
            })
            .await;

        let mut entry = fx.entry(b"payload");
        let impostor = ArtifactSigner::generate("lineageos-1");
        entry.signature = Some(impostor.sign_fingerprint(&entry.fingerprint()).to_string());

        let err = fx
            .verifier(3)
            .verify(&entry, KEY, &fx.store, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::SignatureInvalid { .. }));
        mock.assert_hits_async(1).await;
        assert!(!fx.store.exists(KEY).await.unwrap());
    }

    #[tokio::test]
    async fn test_declared_md5_is_checked() {
        let fx = fixture().await;
        fx.server
            .mock_async(|when, then| {
                when.path("/artifact.zip");
                then.status(200).body("payload");
            })
            .await;

        let mut entry = fx.entry(b"payload");
        entry.md5 = Some(BuildHashes::compute(b"other").md5);

        let err = fx
            .verifier(1)
            .verify(&entry, KEY, &fx.store, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_download_is_discarded() {
        let fx = fixture().await;
        fx.server
            .mock_async(|when, then| {
                when.path("/artifact.zip");
                then.status(200).body("payload");
            })
            .await;

        let entry = fx.entry(b"payload");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .verifier(1)
            .verify(&entry, KEY, &fx.store, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(fx.files_on_disk(), 0);
    }

    #[test]
    fn test_load_trusted_key_requires_config() {
        let config = UpstreamConfig::default();
        assert!(matches!(
            load_trusted_key(&config),
            Err(PipelineError::NoTrustedKey)
        ));
    }
}
