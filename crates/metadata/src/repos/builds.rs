//! Build repository trait.

use crate::error::MetadataResult;
use crate::models::{BuildFilter, BuildRow, BuildStatistics, BuildUpsert};
use async_trait::async_trait;
use mirror_core::BuildId;

/// Repository for build records.
///
/// `upsert_build` and `set_upstream_availability` are the only mutations;
/// each runs in its own transaction. Rows are never deleted.
#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Insert a new build or update an existing one, keyed by
    /// (device, version, filename, sha256). Returns the stored row.
    async fn upsert_build(&self, build: &BuildUpsert) -> MetadataResult<BuildRow>;

    async fn find_build(&self, id: BuildId) -> MetadataResult<Option<BuildRow>>;

    async fn find_build_by_identity(
        &self,
        device: &str,
        version: &str,
        filename: &str,
        sha256: &str,
    ) -> MetadataResult<Option<BuildRow>>;

    /// A locally held build with the given content hash, if any.
    async fn find_stored_by_sha256(&self, sha256: &str) -> MetadataResult<Option<BuildRow>>;

    async fn list_builds(&self, filter: &BuildFilter) -> MetadataResult<Vec<BuildRow>>;

    /// Distinct (device, version) pairs with at least one local copy.
    async fn stored_groups(&self) -> MetadataResult<Vec<(String, String)>>;

    /// Devices with any build still listed upstream.
    async fn upstream_devices(&self) -> MetadataResult<Vec<String>>;

    /// Mark exactly `filenames` of `device` as listed upstream.
    /// Returns the number of rows flagged.
    async fn set_upstream_availability(
        &self,
        device: &str,
        filenames: &[String],
    ) -> MetadataResult<u64>;

    async fn statistics(&self) -> MetadataResult<BuildStatistics>;
}
