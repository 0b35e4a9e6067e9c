use anyhow::{Context, Result};
use mirror_core::UploadProgress;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("failed to build API URL")
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = req.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("API error ({}): {}", status, error_message(&body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Like `send_json`, but a 404 yields `None`.
    async fn send_optional<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<Option<T>> {
        let response = req.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("API error ({}): {}", status, error_message(&body));
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    pub async fn list_builds(&self) -> Result<Vec<BuildSummary>> {
        let url = self.url("/api/builds")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn get_build(&self, id: i64) -> Result<Option<BuildSummary>> {
        let url = self.url(&format!("/api/builds/{id}"))?;
        self.send_optional(self.http.get(url)).await
    }

    pub async fn statistics(&self) -> Result<StatisticsResponse> {
        let url = self.url("/api/statistics")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn request_upload(&self, id: i64) -> Result<UploadAccepted> {
        let url = self.url("/api/uploads")?;
        self.send_json(self.http.post(url).json(&UploadRequest { id }))
            .await
    }

    /// Progress of the job for `id`, or `None` once it has left the queue.
    pub async fn get_upload(&self, id: i64) -> Result<Option<UploadProgress>> {
        let url = self.url(&format!("/api/uploads/{id}"))?;
        self.send_optional(self.http.get(url)).await
    }

    pub async fn active_uploads(&self) -> Result<Vec<i64>> {
        let url = self.url("/api/uploads")?;
        self.send_json(self.http.get(url)).await
    }

    /// Poll an upload job until it leaves the queue, fails, runs out of
    /// polls, or `cancel` fires.
    ///
    /// A job that disappears is resolved by re-reading the build: a
    /// remote URL means it was promoted, otherwise it is still local.
    pub async fn wait_for_upload<F>(
        &self,
        id: i64,
        options: PollOptions,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<UploadOutcome>
    where
        F: FnMut(&UploadProgress),
    {
        for _ in 0..options.max_polls {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(UploadOutcome::Cancelled),
                polled = self.get_upload(id) => polled?,
            };

            match polled {
                Some(UploadProgress {
                    error: Some(message),
                    ..
                }) => return Ok(UploadOutcome::Failed(message)),
                Some(progress) => {
                    tracing::debug!(id, progress = progress.progress, size = progress.size, "Upload progress");
                    on_progress(&progress)
                }
                None => {
                    let build = self
                        .get_build(id)
                        .await?
                        .with_context(|| format!("build {id} disappeared"))?;
                    return Ok(match build.url {
                        Some(url) => UploadOutcome::Promoted(url),
                        None => UploadOutcome::StillLocal,
                    });
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(UploadOutcome::Cancelled),
                _ = tokio::time::sleep(options.interval) => {}
            }
        }
        Ok(UploadOutcome::TimedOut)
    }
}

/// Pull `message` out of a portal error body, falling back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string())
}

/// Bounds for [`ApiClient::wait_for_upload`].
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_polls: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Promoted(String),
    /// The job ended without a remote copy being recorded.
    StillLocal,
    Failed(String),
    TimedOut,
    Cancelled,
}

// =============================================================================
// Request/response types (mirrored from server handlers)
// =============================================================================

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Serialize)]
pub struct UploadRequest {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UploadAccepted {
    pub id: i64,
    pub queued: bool,
}

#[derive(Debug, Deserialize)]
pub struct BuildSummary {
    pub id: i64,
    pub filename: String,
    pub filesize: i64,
    pub sha256: String,
    pub device: String,
    pub url: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatisticsResponse {
    pub build_count_known: i64,
    pub build_count_stored: i64,
    pub build_size_stored: i64,
    pub device_count: i64,
    pub device_version_count: i64,
    pub build_size_average: Option<f64>,
}
