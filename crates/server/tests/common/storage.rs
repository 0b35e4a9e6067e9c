//! Remote storage doubles for promotion tests.

use async_trait::async_trait;
use bytes::Bytes;
use mirror_storage::{
    ByteStream, FilesystemBackend, ObjectStore, StorageError, StorageResult, StreamingUpload,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// Filesystem remote whose uploads accept one chunk per released permit.
#[allow(dead_code)]
pub struct GatedStore {
    inner: FilesystemBackend,
    gate: Arc<Semaphore>,
    attempts: AtomicUsize,
}

#[allow(dead_code)]
impl GatedStore {
    pub async fn new(root: &Path) -> Self {
        Self {
            inner: FilesystemBackend::new(root).await.unwrap(),
            gate: Arc::new(Semaphore::new(0)),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of uploads started.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Let `chunks` more chunk writes through.
    pub fn release(&self, chunks: usize) {
        self.gate.add_permits(chunks);
    }

    /// Let every write through from now on.
    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

struct GatedUpload {
    inner: Box<dyn StreamingUpload>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl StreamingUpload for GatedUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.gate
            .acquire()
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
            .forget();
        self.inner.write(data).await
    }

    fn bytes_written(&self) -> u64 {
        self.inner.bytes_written()
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        self.inner.finish().await
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.inner.abort().await
    }
}

#[async_trait]
impl ObjectStore for GatedStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(GatedUpload {
            inner: self.inner.put_stream(key).await?,
            gate: self.gate.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "gated"
    }
}

/// Remote whose uploads always fail mid-transfer with an I/O error.
#[allow(dead_code)]
#[derive(Default)]
pub struct FailingStore {
    attempts: AtomicUsize,
    aborted: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FailingStore {
    /// Number of uploads started.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of uploads discarded.
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

struct FailingUpload {
    aborted: Arc<AtomicUsize>,
}

#[async_trait]
impl StreamingUpload for FailingUpload {
    async fn write(&mut self, _data: Bytes) -> StorageResult<()> {
        Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by remote",
        )))
    }

    fn bytes_written(&self) -> u64 {
        0
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        Err(StorageError::Io(std::io::Error::other("nothing to commit")))
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FailingStore {
    async fn exists(&self, _key: &str) -> StorageResult<bool> {
        Ok(false)
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn put_stream(&self, _key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FailingUpload {
            aborted: self.aborted.clone(),
        }))
    }

    async fn delete(&self, _key: &str) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}
