//! Build listing and statistics endpoints.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use super::extract::BuildIdPath;
use axum::extract::State;
use mirror_core::BuildAvailability;
use mirror_metadata::{BuildFilter, BuildRow};
use serde::Serialize;

/// One build as listed by the portal.
///
/// `url` set means the build is served remotely; `path` set without
/// `url` means it is only held locally; neither means superseded.
#[derive(Debug, Serialize)]
pub struct BuildSummary {
    pub id: i64,
    pub filename: String,
    pub filesize: i64,
    pub sha256: String,
    pub device: String,
    pub url: Option<String>,
    pub path: Option<String>,
}

impl From<&BuildRow> for BuildSummary {
    fn from(row: &BuildRow) -> Self {
        let (url, path) = match row.availability() {
            BuildAvailability::Remote(url) => (Some(url), row.local_path.clone()),
            BuildAvailability::Local(path) => (None, Some(path)),
            BuildAvailability::Superseded => (None, None),
        };
        Self {
            id: row.id,
            filename: row.filename.clone(),
            filesize: row.size,
            sha256: row.sha256.clone(),
            device: row.device.clone(),
            url,
            path,
        }
    }
}

/// A single build with its full hash set.
#[derive(Debug, Serialize)]
pub struct BuildDetail {
    #[serde(flatten)]
    pub summary: BuildSummary,
    pub version: String,
    pub date: String,
    pub md5: String,
    pub sha1: String,
    pub sha512: String,
    pub signature_valid: bool,
    pub available_upstream: bool,
}

impl From<&BuildRow> for BuildDetail {
    fn from(row: &BuildRow) -> Self {
        Self {
            summary: BuildSummary::from(row),
            version: row.version.clone(),
            date: row.date.clone(),
            md5: row.md5.clone(),
            sha1: row.sha1.clone(),
            sha512: row.sha512.clone(),
            signature_valid: row.signature_valid,
            available_upstream: row.available_upstream,
        }
    }
}

/// GET /api/builds
pub async fn list_builds(State(state): State<AppState>) -> ApiResult<Json<Vec<BuildSummary>>> {
    let rows = state.metadata.list_builds(&BuildFilter::default()).await?;
    Ok(Json(rows.iter().map(BuildSummary::from).collect()))
}

/// GET /api/builds/{id}
pub async fn get_build(
    State(state): State<AppState>,
    BuildIdPath(id): BuildIdPath,
) -> ApiResult<Json<BuildDetail>> {
    let row = state
        .metadata
        .find_build(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Build ID not found".to_string()))?;
    Ok(Json(BuildDetail::from(&row)))
}

/// Aggregate counts for the portal header.
#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub build_count_known: i64,
    pub build_count_stored: i64,
    pub build_size_stored: i64,
    pub device_count: i64,
    pub device_version_count: i64,
    pub build_size_average: Option<f64>,
}

/// GET /api/statistics
pub async fn get_statistics(State(state): State<AppState>) -> ApiResult<Json<StatisticsResponse>> {
    let stats = state.metadata.statistics().await?;
    Ok(Json(StatisticsResponse {
        build_count_known: stats.build_count_known,
        build_count_stored: stats.build_count_stored,
        build_size_stored: stats.build_size_stored,
        device_count: stats.device_count,
        device_version_count: stats.device_version_count,
        build_size_average: stats.build_size_average,
    }))
}
