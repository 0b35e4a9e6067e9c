//! Application state shared across handlers.

use crate::uploads::UploadOrchestrator;
use mirror_core::config::AppConfig;
use mirror_metadata::MetadataStore;
use mirror_pipeline::LocalStore;
use mirror_storage::ObjectStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Local artifact cache.
    pub local: Arc<LocalStore>,
    /// Promotion job registry.
    pub uploads: UploadOrchestrator,
}

impl AppState {
    /// Create the state and the orchestrator that promotes into `remote`.
    ///
    /// Cancelling `shutdown` stops every upload worker.
    pub fn new(
        config: AppConfig,
        local: Arc<LocalStore>,
        remote: Arc<dyn ObjectStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let uploads = UploadOrchestrator::new(
            local.clone(),
            remote,
            config.remote.bucket_name(),
            config.upload.clone(),
            shutdown,
        );
        Self {
            metadata: local.metadata().clone(),
            config: Arc::new(config),
            local,
            uploads,
        }
    }
}
