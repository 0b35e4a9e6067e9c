//! Object storage abstraction and backends for the build mirror.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait shared by the local cache and the remote
//!   promotion target
//! - Staged streaming uploads that only become visible on commit
//! - Backends: local filesystem and S3-compatible

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectStore, StreamingUpload};

use mirror_core::config::StorageConfig;
use std::sync::Arc;

/// Create the remote object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mirror_core::config::StorageConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("remote"),
        };

        let store = from_config(&config).await.unwrap();
        let mut upload = store.put_stream("oneplus3/20.0/a.zip").await.unwrap();
        upload.write(Bytes::from_static(b"zip")).await.unwrap();
        upload.finish().await.unwrap();
        assert!(store.exists("oneplus3/20.0/a.zip").await.unwrap());
        assert_eq!(store.backend_name(), "filesystem");
    }

    #[tokio::test]
    async fn from_config_s3_ok() {
        let config = StorageConfig::S3 {
            bucket: "mirror-builds".to_string(),
            endpoint: Some("minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("builds".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "s3");
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "mirror-builds".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
