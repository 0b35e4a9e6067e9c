//! Verified artifact cache on local disk.
//!
//! Bytes live in a [`FilesystemBackend`] under `device/version/filename`;
//! which of them are held is recorded on the build rows, so every
//! operation here touches both.

use crate::error::PipelineResult;
use crate::verifier::{Verified, abort_quietly};
use mirror_core::ManifestEntry;
use mirror_metadata::{BuildFilter, BuildRow, BuildUpsert, MetadataStore, Patch};
use mirror_storage::{FilesystemBackend, ObjectStore, StorageError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

/// Identity of a build about to be stored.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub device: String,
    pub version: String,
    pub filename: String,
    pub date: String,
    pub available_upstream: bool,
}

impl BuildRecord {
    pub fn from_entry(device: &str, entry: &ManifestEntry) -> PipelineResult<Self> {
        Ok(Self {
            device: device.to_string(),
            version: entry.version.clone(),
            filename: entry.filename.clone(),
            date: entry.date()?,
            available_upstream: true,
        })
    }
}

pub struct LocalStore {
    backend: Arc<FilesystemBackend>,
    metadata: Arc<dyn MetadataStore>,
}

impl LocalStore {
    pub fn new(backend: Arc<FilesystemBackend>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { backend, metadata }
    }

    pub async fn open(
        root: impl AsRef<Path>,
        metadata: Arc<dyn MetadataStore>,
    ) -> PipelineResult<Self> {
        let backend = FilesystemBackend::new(root).await?;
        Ok(Self::new(Arc::new(backend), metadata))
    }

    pub fn backend(&self) -> &Arc<FilesystemBackend> {
        &self.backend
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Target for staged downloads.
    pub fn staging(&self) -> &dyn ObjectStore {
        self.backend.as_ref()
    }

    pub async fn contains(&self, key: &str) -> PipelineResult<bool> {
        Ok(self.backend.exists(key).await?)
    }

    /// Commit verified bytes and record the local path.
    ///
    /// Content whose sha256 is already held locally is not stored twice:
    /// the staged bytes are discarded and the build is recorded against
    /// the existing file.
    #[instrument(skip(self, record, verified), fields(key = %verified.key()))]
    pub async fn put(&self, record: BuildRecord, verified: Verified) -> PipelineResult<BuildRow> {
        let key = verified.key().to_string();
        let mut upsert = BuildUpsert {
            filename: record.filename,
            device: record.device,
            version: record.version,
            date: record.date,
            size: verified.size(),
            hashes: verified.hashes().clone(),
            signature_valid: verified.signature_valid(),
            available_upstream: Some(record.available_upstream),
            local_path: Patch::Set(key.clone()),
            remote_url: Patch::Keep,
        };

        if let Some(existing) = self
            .metadata
            .find_stored_by_sha256(&upsert.hashes.sha256)
            .await?
        {
            abort_quietly(verified.into_upload(), &key).await;
            if existing.device == upsert.device
                && existing.version == upsert.version
                && existing.filename == upsert.filename
            {
                tracing::debug!(existing = existing.id, "Build already stored locally");
                return Ok(existing);
            }
            let Some(shared) = existing.local_path.clone() else {
                return Ok(existing);
            };
            tracing::info!(existing = existing.id, path = %shared, "Content already stored, sharing file");
            upsert.local_path = Patch::Set(shared);
            return Ok(self.metadata.upsert_build(&upsert).await?);
        }

        verified.into_upload().finish().await?;
        let row = match self.metadata.upsert_build(&upsert).await {
            Ok(row) => row,
            Err(e) => {
                // Unrecorded bytes would be skipped by every later sweep.
                if let Err(del) = self.backend.delete(&key).await {
                    tracing::warn!(key = %key, error = %del, "Failed to remove unrecorded file");
                }
                return Err(e.into());
            }
        };
        tracing::info!(id = row.id, "Stored build locally");
        Ok(row)
    }

    /// Whether a build other than the one just cleared still holds `key`.
    async fn still_referenced(&self, sha256: &str, key: &str) -> PipelineResult<bool> {
        Ok(self
            .metadata
            .find_stored_by_sha256(sha256)
            .await?
            .is_some_and(|other| other.local_path.as_deref() == Some(key)))
    }

    /// Drop the local copy of a build.
    ///
    /// The row is cleared before the file goes, so no row ever points at
    /// missing bytes. `remote_url` is left untouched.
    #[instrument(skip(self, row), fields(id = row.id))]
    pub async fn remove(&self, row: &BuildRow) -> PipelineResult<BuildRow> {
        let Some(key) = row.local_path.clone() else {
            return Ok(row.clone());
        };
        let updated = self
            .metadata
            .upsert_build(&BuildUpsert::storage_patch(row, Patch::Clear, Patch::Keep))
            .await?;
        if self.still_referenced(&row.sha256, &key).await? {
            tracing::debug!(key = %key, "File shared with another build, keeping it");
            return Ok(updated);
        }

        match self.backend.delete(&key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to delete local file"),
        }
        Ok(updated)
    }

    /// Locally held builds of one group, newest first by build date.
    pub async fn list(&self, device: &str, version: &str) -> PipelineResult<Vec<BuildRow>> {
        Ok(self
            .metadata
            .list_builds(&BuildFilter::stored_in(device, version))
            .await?)
    }

    /// Move a build's local copy to `dir`, clearing its local path first.
    ///
    /// A file still shared with another build is copied instead.
    #[instrument(skip(self, row, dir), fields(id = row.id))]
    pub async fn move_out(&self, row: &BuildRow, dir: &Path) -> PipelineResult<Option<PathBuf>> {
        let Some(key) = row.local_path.clone() else {
            return Ok(None);
        };
        self.metadata
            .upsert_build(&BuildUpsert::storage_patch(row, Patch::Clear, Patch::Keep))
            .await?;

        let dest = dir.join(&row.filename);
        if self.still_referenced(&row.sha256, &key).await? {
            self.backend.copy_out(&key, &dest).await?;
        } else {
            self.backend.move_out(&key, &dest).await?;
        }
        Ok(Some(dest))
    }
}
