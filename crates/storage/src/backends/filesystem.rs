//! Local filesystem storage backend.
//!
//! Used for the local artifact cache and as a remote target in tests and
//! single-host deployments. Writes land in a `.tmp.{uuid}` sibling and are
//! renamed into place on commit, so readers never observe partial files.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Read size for streaming reads (16 KiB).
const STREAM_CHUNK_SIZE: usize = mirror_core::DOWNLOAD_CHUNK_SIZE;

/// Infix marking in-progress writes.
const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem object store.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move an object out of the store to `dest`, creating parent directories.
    ///
    /// Falls back to copy + delete when `dest` is on another filesystem.
    #[instrument(skip(self, dest), fields(backend = "filesystem", dest = %dest.display()))]
    pub async fn move_out(&self, key: &str, dest: &Path) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::rename(&path, dest).await.is_err() {
            fs::copy(&path, dest).await?;
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Copy an object out of the store to `dest`, leaving it in place.
    #[instrument(skip(self, dest), fields(backend = "filesystem", dest = %dest.display()))]
    pub async fn copy_out(&self, key: &str, dest: &Path) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&path, dest).await?;
        Ok(())
    }

    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Resolve a key under the root, rejecting traversal through `..`,
    /// absolute paths and symlinks that lead outside the root.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Ok(root.to_path_buf());
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!("absolute key: {key}")));
        }
        if Path::new(key)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize()?;

        // Nearest existing ancestor (or the path itself) must resolve inside the root.
        let mut probe = Some(path.as_path());
        while let Some(candidate) = probe {
            match std::fs::symlink_metadata(candidate) {
                Ok(meta) => {
                    let canonical = candidate.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    probe = candidate.parent();
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }

        Ok(path)
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        let temp_name = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or(temp_name),
        )
    }
}

fn not_found_or_io(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path).await.map_err(not_found_or_io(key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = Self::temp_path(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path).await.map_err(not_found_or_io(key))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
