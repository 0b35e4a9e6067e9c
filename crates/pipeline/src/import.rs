//! Adding operator-supplied artifact files to the local store.

use crate::error::{PipelineError, PipelineResult};
use crate::local_store::{BuildRecord, LocalStore};
use crate::verifier::{Verified, abort_quietly, write_chunks};
use futures::StreamExt;
use mirror_core::manifest::artifact_fingerprint;
use mirror_core::{BuildHashes, BuildName, DOWNLOAD_CHUNK_SIZE, artifact_key};
use mirror_metadata::BuildRow;
use mirror_signer::SignatureVerifier;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Extension of a detached `keyname:base64` signature next to a file.
pub const SIGNATURE_SUFFIX: &str = ".sig";

/// How detached signatures are treated during an import.
#[derive(Clone, Copy)]
pub enum SignaturePolicy<'a> {
    /// Every file needs a `.sig` that verifies against the trusted key.
    Required(&'a dyn SignatureVerifier),
    /// The operator opted out; files are recorded as unverified.
    Disabled,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: Vec<BuildRow>,
    pub skipped: Vec<(PathBuf, String)>,
}

/// Import artifact files, moving them into the store.
///
/// Files are skipped, never fatal, when their name does not parse, the
/// artifact is already present, or the signature policy rejects them.
/// Imported builds are recorded as not available upstream.
pub async fn import_files(
    local: &LocalStore,
    policy: SignaturePolicy<'_>,
    files: &[PathBuf],
) -> ImportReport {
    let mut report = ImportReport::default();
    for path in files {
        match import_file(local, policy, path).await {
            Ok(row) => report.imported.push(row),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping import");
                report.skipped.push((path.clone(), e.to_string()));
            }
        }
    }
    report
}

#[instrument(skip(local, policy, path), fields(path = %path.display()))]
async fn import_file(
    local: &LocalStore,
    policy: SignaturePolicy<'_>,
    path: &Path,
) -> PipelineResult<BuildRow> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::InvalidArtifact(format!("{}", path.display())))?;
    let name = BuildName::parse(filename)?;
    let key = artifact_key(&name.device, &name.version, filename)?;
    if local.contains(&key).await? {
        return Err(PipelineError::InvalidArtifact(format!(
            "'{key}' already exists"
        )));
    }

    let file = tokio::fs::File::open(path).await?;
    let mut body = ReaderStream::with_capacity(file, DOWNLOAD_CHUNK_SIZE);
    let mut upload = local.staging().put_stream(&key).await?;
    let mut hasher = BuildHashes::hasher();

    let copied: PipelineResult<()> = async {
        while let Some(chunk) = body.next().await {
            write_chunks(&mut *upload, &mut hasher, chunk?).await?;
        }
        Ok(())
    }
    .await;
    if let Err(e) = copied {
        abort_quietly(upload, &key).await;
        return Err(e);
    }

    let size = hasher.len();
    let hashes = hasher.finalize();
    let signature_valid = match policy {
        SignaturePolicy::Disabled => false,
        SignaturePolicy::Required(verifier) => {
            if let Err(e) = check_detached(path, filename, &hashes, size, verifier).await {
                abort_quietly(upload, &key).await;
                return Err(e);
            }
            true
        }
    };

    let record = BuildRecord {
        device: name.device,
        version: name.version,
        filename: filename.to_string(),
        date: name.date,
        available_upstream: false,
    };
    let row = local
        .put(record, Verified::new(key, hashes, size, signature_valid, upload))
        .await?;

    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(error = %e, "Imported but could not remove source file");
    }
    tracing::info!(id = row.id, "Imported build");
    Ok(row)
}

/// A missing `.sig` is rejected like a bad one.
async fn check_detached(
    path: &Path,
    filename: &str,
    hashes: &BuildHashes,
    size: u64,
    verifier: &dyn SignatureVerifier,
) -> PipelineResult<()> {
    let mut sig_path = path.as_os_str().to_owned();
    sig_path.push(SIGNATURE_SUFFIX);
    let signature = match tokio::fs::read_to_string(&sig_path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::SignatureInvalid {
                filename: filename.to_string(),
                reason: "no detached signature".to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    verifier
        .verify(
            &artifact_fingerprint(filename, &hashes.sha256, size),
            Some(signature.trim()),
        )
        .map_err(|e| PipelineError::SignatureInvalid {
            filename: filename.to_string(),
            reason: e.to_string(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::tests::local_store;
    use mirror_metadata::BuildFilter;
    use mirror_signer::{ArtifactSigner, TrustedKeyVerifier};

    const NAME: &str = "lineage-20.0-20240101-nightly-oneplus3-signed.zip";

    fn sign_next_to(dir: &Path, signer: &ArtifactSigner, filename: &str, content: &[u8]) {
        let fingerprint = artifact_fingerprint(
            filename,
            &BuildHashes::compute(content).sha256,
            content.len() as u64,
        );
        std::fs::write(
            dir.join(format!("{filename}{SIGNATURE_SUFFIX}")),
            signer.sign_fingerprint(&fingerprint).to_string(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_import_rejects_missing_signature() {
        let (store, dir) = local_store().await;
        let signer = ArtifactSigner::generate("lineageos-1");
        let trusted = TrustedKeyVerifier::from_public_key(&signer.public_key_string()).unwrap();
        let src = dir.path().join(NAME);
        std::fs::write(&src, b"imported bytes").unwrap();

        let report =
            import_files(&store, SignaturePolicy::Required(&trusted), &[src.clone()]).await;
        assert!(report.imported.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(
            report.skipped[0].1.contains("no detached signature"),
            "{}",
            report.skipped[0].1
        );
        assert!(src.exists(), "rejected files stay in place");
        let key = artifact_key("oneplus3", "20.0", NAME).unwrap();
        assert!(!store.contains(&key).await.unwrap());
        assert!(
            store
                .metadata()
                .list_builds(&BuildFilter::default())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_import_unverified_when_disabled() {
        let (store, dir) = local_store().await;
        let src = dir.path().join(NAME);
        std::fs::write(&src, b"imported bytes").unwrap();

        let report = import_files(&store, SignaturePolicy::Disabled, &[src.clone()]).await;
        assert!(report.skipped.is_empty());
        let row = &report.imported[0];
        assert_eq!(row.device, "oneplus3");
        assert_eq!(row.version, "20.0");
        assert_eq!(row.date, "20240101");
        assert!(!row.available_upstream);
        assert!(!row.signature_valid);
        assert_eq!(row.sha256, BuildHashes::compute(b"imported bytes").sha256);
        assert!(!src.exists(), "source is moved into the store");
    }

    #[tokio::test]
    async fn test_import_checks_detached_signature() {
        let (store, dir) = local_store().await;
        let signer = ArtifactSigner::generate("lineageos-1");
        let trusted = TrustedKeyVerifier::from_public_key(&signer.public_key_string()).unwrap();

        let content = b"signed bytes";
        let good = dir.path().join(NAME);
        std::fs::write(&good, content).unwrap();
        sign_next_to(dir.path(), &signer, NAME, content);

        // Signature made for the good file's fingerprint, not this one.
        let bad_name = "lineage-20.0-20240102-nightly-oneplus3-signed.zip";
        let bad = dir.path().join(bad_name);
        std::fs::write(&bad, b"tampered").unwrap();
        std::fs::copy(
            dir.path().join(format!("{NAME}{SIGNATURE_SUFFIX}")),
            dir.path().join(format!("{bad_name}{SIGNATURE_SUFFIX}")),
        )
        .unwrap();

        let report = import_files(
            &store,
            SignaturePolicy::Required(&trusted),
            &[good, bad.clone()],
        )
        .await;
        assert_eq!(report.imported.len(), 1);
        assert!(report.imported[0].signature_valid);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, bad);
        assert!(bad.exists(), "rejected files stay in place");
    }

    #[tokio::test]
    async fn test_import_same_content_under_two_names() {
        let (store, dir) = local_store().await;
        let signer = ArtifactSigner::generate("lineageos-1");
        let trusted = TrustedKeyVerifier::from_public_key(&signer.public_key_string()).unwrap();

        let content = b"identical bytes";
        let second_name = "lineage-20.0-20240102-nightly-oneplus3-signed.zip";
        let first = dir.path().join(NAME);
        let second = dir.path().join(second_name);
        for (path, name) in [(&first, NAME), (&second, second_name)] {
            std::fs::write(path, content).unwrap();
            sign_next_to(dir.path(), &signer, name, content);
        }

        let report = import_files(
            &store,
            SignaturePolicy::Required(&trusted),
            &[first.clone(), second.clone()],
        )
        .await;
        assert!(report.skipped.is_empty(), "{:?}", report.skipped);
        assert_eq!(report.imported.len(), 2);
        assert_eq!(report.imported[1].filename, second_name);
        assert_ne!(report.imported[0].id, report.imported[1].id);
        assert_eq!(report.imported[0].local_path, report.imported[1].local_path);
        assert!(!first.exists() && !second.exists());

        let rows = store.metadata().list_builds(&BuildFilter::default()).await.unwrap();
        let mut names: Vec<&str> = rows.iter().map(|r| r.filename.as_str()).collect();
        names.sort();
        assert_eq!(names, vec![NAME, second_name]);
    }

    #[tokio::test]
    async fn test_import_skips_bad_names_and_duplicates() {
        let (store, dir) = local_store().await;
        let odd = dir.path().join("random.zip");
        std::fs::write(&odd, b"x").unwrap();
        let first = dir.path().join(NAME);
        std::fs::write(&first, b"one").unwrap();

        let report = import_files(&store, SignaturePolicy::Disabled, &[odd, first.clone()]).await;
        assert_eq!(report.imported.len(), 1);
        assert_eq!(report.skipped.len(), 1);

        std::fs::write(&first, b"two").unwrap();
        let report = import_files(&store, SignaturePolicy::Disabled, &[first]).await;
        assert!(report.imported.is_empty());
        assert!(report.skipped[0].1.contains("already exists"));
    }
}
