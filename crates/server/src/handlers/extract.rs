//! Request extractors shared by the portal handlers.

use crate::error::ApiError;
use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use mirror_core::BuildId;

/// Build id taken from the `{id}` path segment.
///
/// Rejects non-integer segments with the portal's JSON error body instead
/// of axum's plain-text rejection.
#[derive(Debug, Clone, Copy)]
pub struct BuildIdPath(pub BuildId);

impl<S> FromRequestParts<S> for BuildIdPath
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<i64>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| {
                tracing::debug!(error = %rejection, "Rejected build id path");
                ApiError::BadRequest("Invalid build ID type".to_string())
            })?;
        Ok(Self(BuildId::new(id)))
    }
}
