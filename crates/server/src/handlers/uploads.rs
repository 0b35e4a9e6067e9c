//! Promotion request and progress endpoints.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::uploads::Admission;
use axum::Json;
use super::extract::BuildIdPath;
use axum::extract::State;
use axum::http::StatusCode;
use bytes::Bytes;
use mirror_core::{BuildId, UploadProgress};
use serde::Serialize;
use serde_json::Value;

/// Response to an accepted upload request.
#[derive(Debug, Serialize)]
pub struct UploadAccepted {
    pub id: i64,
    /// False when a job for this build was already active.
    pub queued: bool,
}

/// Extract the build id from a `{"id": ...}` request body.
fn parse_build_id(body: &[u8]) -> ApiResult<BuildId> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| ApiError::BadRequest("Invalid build ID type".to_string()))?;

    match value.get("id") {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => match n.as_i64() {
            Some(id) if id >= 0 => Ok(BuildId::new(id)),
            _ => Err(ApiError::BadRequest("Build ID out of range".to_string())),
        },
        _ => Err(ApiError::BadRequest("Invalid build ID type".to_string())),
    }
}

/// POST /api/uploads
pub async fn request_upload(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<UploadAccepted>)> {
    let id = parse_build_id(&body)?;
    let admission = state.uploads.request(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            id: id.as_i64(),
            queued: admission == Admission::Queued,
        }),
    ))
}

/// GET /api/uploads/{id}
pub async fn get_upload(
    State(state): State<AppState>,
    BuildIdPath(id): BuildIdPath,
) -> ApiResult<Json<UploadProgress>> {
    Ok(Json(state.uploads.progress(id)?))
}

/// GET /api/uploads
pub async fn list_uploads(State(state): State<AppState>) -> Json<Vec<BuildId>> {
    Json(state.uploads.active())
}
