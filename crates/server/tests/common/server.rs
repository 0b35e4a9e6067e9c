//! Server test utilities.

use super::fixtures::build_upsert;
use bytes::Bytes;
use mirror_core::artifact_key;
use mirror_core::config::{AppConfig, LocalStoreConfig, MetadataConfig, StorageConfig};
use mirror_metadata::{BuildRow, MetadataStore, SqliteStore};
use mirror_pipeline::LocalStore;
use mirror_server::{AppState, create_router};
use mirror_storage::{FilesystemBackend, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub remote: Arc<dyn ObjectStore>,
    pub shutdown: CancellationToken,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server promoting into a temporary filesystem remote.
    pub async fn new() -> Self {
        Self::build(|_| {}, None).await
    }

    /// Create a test server promoting into `remote`.
    pub async fn with_remote(remote: Arc<dyn ObjectStore>) -> Self {
        Self::build(|_| {}, Some(remote)).await
    }

    /// Create a test server with a modified configuration.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(modifier, None).await
    }

    pub async fn build<F>(modifier: F, remote: Option<Arc<dyn ObjectStore>>) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let local_path = temp_dir.path().join("builds");
        let remote_path = temp_dir.path().join("remote");
        let db_path = temp_dir.path().join("mirror.db");

        let mut config = AppConfig::for_testing();
        config.local = LocalStoreConfig {
            path: local_path.clone(),
        };
        config.remote = StorageConfig::Filesystem {
            path: remote_path.clone(),
        };
        config.metadata = MetadataConfig::Sqlite {
            path: db_path.clone(),
            query_timeout_secs: None,
        };
        modifier(&mut config);

        let remote = match remote {
            Some(remote) => remote,
            None => Arc::new(
                FilesystemBackend::new(&remote_path)
                    .await
                    .expect("Failed to create remote backend"),
            ),
        };
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );
        let local = Arc::new(
            LocalStore::open(&local_path, metadata)
                .await
                .expect("Failed to open local store"),
        );

        let shutdown = CancellationToken::new();
        let state = AppState::new(config, local, remote.clone(), shutdown.clone());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            remote,
            shutdown,
            _temp_dir: temp_dir,
        }
    }

    /// Get the metadata store.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.state.metadata
    }

    pub fn local_root(&self) -> PathBuf {
        self.state.local.backend().root().to_path_buf()
    }

    /// Store `content` locally and record it as an Available-local build.
    pub async fn seed_local(&self, filename: &str, date: &str, content: &[u8]) -> BuildRow {
        let key = artifact_key("oneplus3", "20.0", filename).unwrap();
        let mut upload = self.state.local.backend().put_stream(&key).await.unwrap();
        upload.write(Bytes::copy_from_slice(content)).await.unwrap();
        upload.finish().await.unwrap();
        self.metadata()
            .upsert_build(&build_upsert(filename, date, content, Some(key), None))
            .await
            .unwrap()
    }

    /// Record a build that is only served remotely.
    pub async fn seed_remote(&self, filename: &str, date: &str, content: &[u8]) -> BuildRow {
        let url = format!("https://downloads.example/mirror-builds/{filename}");
        self.metadata()
            .upsert_build(&build_upsert(filename, date, content, None, Some(url)))
            .await
            .unwrap()
    }

    /// Record a build with no copy anywhere.
    pub async fn seed_superseded(&self, filename: &str, date: &str, content: &[u8]) -> BuildRow {
        self.metadata()
            .upsert_build(&build_upsert(filename, date, content, None, None))
            .await
            .unwrap()
    }
}
