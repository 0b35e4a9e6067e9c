//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Object store holding build artifacts under `device/version/filename` keys.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Start a streaming upload.
    ///
    /// Nothing is visible under `key` until [`StreamingUpload::finish`].
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Static identifier for metrics and logging ("s3", "filesystem").
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called at startup before any work is accepted. The default
    /// implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Streaming upload handle.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Bytes accepted so far.
    fn bytes_written(&self) -> u64;

    /// Commit the upload and return total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
