//! Database models mapping to the metadata schema.

use mirror_core::{BuildAvailability, BuildHashes, BuildId};
use sqlx::FromRow;
use time::OffsetDateTime;

/// One discovered artifact. Rows are never deleted.
#[derive(Debug, Clone, FromRow)]
pub struct BuildRow {
    pub id: i64,
    pub filename: String,
    pub device: String,
    pub version: String,
    /// `YYYYMMDD`, the ordering key for retention and listings.
    pub date: String,
    pub size: i64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
    pub signature_valid: bool,
    /// Listed by the most recent successful manifest fetch for its device.
    pub available_upstream: bool,
    /// LocalStore key; present iff the bytes are held locally.
    pub local_path: Option<String>,
    /// Present iff the build was promoted to remote storage.
    pub remote_url: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl BuildRow {
    pub fn build_id(&self) -> BuildId {
        BuildId::new(self.id)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size.max(0) as u64
    }

    pub fn availability(&self) -> BuildAvailability {
        BuildAvailability::from_parts(self.remote_url.as_deref(), self.local_path.as_deref())
    }

    pub fn hashes(&self) -> BuildHashes {
        BuildHashes {
            md5: self.md5.clone(),
            sha1: self.sha1.clone(),
            sha256: self.sha256.clone(),
            sha512: self.sha512.clone(),
        }
    }
}

/// Update of a nullable storage column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T: Clone> Patch<T> {
    /// Apply to the current value.
    pub fn apply(&self, current: Option<T>) -> Option<T> {
        match self {
            Patch::Keep => current,
            Patch::Set(value) => Some(value.clone()),
            Patch::Clear => None,
        }
    }
}

/// Input to the single mutation path of the store.
///
/// Rows are keyed by (device, version, filename, sha256). On insert,
/// `Keep` patches leave the column empty.
#[derive(Debug, Clone)]
pub struct BuildUpsert {
    pub filename: String,
    pub device: String,
    pub version: String,
    pub date: String,
    pub size: u64,
    pub hashes: BuildHashes,
    pub signature_valid: bool,
    /// `None` keeps the stored flag (false on insert).
    pub available_upstream: Option<bool>,
    pub local_path: Patch<String>,
    pub remote_url: Patch<String>,
}

impl BuildUpsert {
    /// Storage-state change for an existing row.
    pub fn storage_patch(row: &BuildRow, local_path: Patch<String>, remote_url: Patch<String>) -> Self {
        Self {
            filename: row.filename.clone(),
            device: row.device.clone(),
            version: row.version.clone(),
            date: row.date.clone(),
            size: row.size_bytes(),
            hashes: row.hashes(),
            signature_valid: row.signature_valid,
            available_upstream: None,
            local_path,
            remote_url,
        }
    }
}

/// Result ordering for [`BuildFilter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildOrder {
    /// Remote, then local, then superseded; each newest first.
    #[default]
    Availability,
    /// Newest first by date, ties broken by id.
    Newest,
}

/// Filter for listing builds.
#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    pub device: Option<String>,
    pub version: Option<String>,
    /// `Some(true)` only builds held locally, `Some(false)` only those not.
    pub stored: Option<bool>,
    pub order: BuildOrder,
}

impl BuildFilter {
    /// Locally held builds of one group, newest first.
    pub fn stored_in(device: &str, version: &str) -> Self {
        Self {
            device: Some(device.to_string()),
            version: Some(version.to_string()),
            stored: Some(true),
            order: BuildOrder::Newest,
        }
    }
}

/// Aggregates over all build rows, recomputed on read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildStatistics {
    pub build_count_known: i64,
    pub build_size_known: i64,
    pub build_count_stored: i64,
    pub build_size_stored: i64,
    pub device_count: i64,
    pub device_version_count: i64,
    /// Mean size over all known builds; `None` when there are none.
    pub build_size_average: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_apply() {
        let current = Some("a".to_string());
        assert_eq!(Patch::Keep.apply(current.clone()), current);
        assert_eq!(
            Patch::Set("b".to_string()).apply(current.clone()),
            Some("b".to_string())
        );
        assert_eq!(Patch::<String>::Clear.apply(current), None);
    }
}
