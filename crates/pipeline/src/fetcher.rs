//! Device roster and manifest retrieval from the upstream updater.

use crate::error::{PipelineError, PipelineResult};
use futures::{Stream, StreamExt, stream};
use mirror_core::ParsedManifest;
use mirror_core::config::UpstreamConfig;
use mirror_core::manifest::parse_device_list;
use tracing::instrument;

/// A device to fetch a manifest for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceTarget {
    pub device: String,
    /// Only refresh upstream flags; never download new builds.
    pub refresh_only: bool,
}

impl DeviceTarget {
    pub fn mirrored(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            refresh_only: false,
        }
    }

    pub fn refresh_only(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            refresh_only: true,
        }
    }
}

/// Outcome of one device's manifest fetch.
#[derive(Debug)]
pub struct DeviceManifest {
    pub device: String,
    pub refresh_only: bool,
    pub manifest: PipelineResult<ParsedManifest>,
}

/// Client for the updater API and the device roster.
#[derive(Clone)]
pub struct ManifestFetcher {
    client: reqwest::Client,
    updater_url: String,
    device_list_url: Option<String>,
    device: Option<String>,
    channel: String,
}

impl ManifestFetcher {
    pub fn new(config: &UpstreamConfig) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("mirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::upstream(&config.updater_url, e))?;
        Ok(Self {
            client,
            updater_url: config.updater_url.trim_end_matches('/').to_string(),
            device_list_url: config.device_list_url.clone(),
            device: config.device.clone(),
            channel: config.channel.clone(),
        })
    }

    /// Shared HTTP client, reused for artifact downloads.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn manifest_url(&self, device: &str) -> String {
        format!(
            "{}/api/v1/{device}/{}/unused",
            self.updater_url, self.channel
        )
    }

    async fn get_ok(&self, url: &str) -> PipelineResult<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::upstream(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::upstream(url, format!("HTTP {status}")));
        }
        Ok(response)
    }

    /// Devices to mirror: the configured single device, or the roster.
    #[instrument(skip(self))]
    pub async fn fetch_devices(&self) -> PipelineResult<Vec<String>> {
        if let Some(device) = &self.device {
            return Ok(vec![device.clone()]);
        }
        let Some(url) = &self.device_list_url else {
            return Err(PipelineError::upstream("", "no device or roster configured"));
        };

        tracing::info!(url = %url, "Fetching device roster");
        let text = self
            .get_ok(url)
            .await?
            .text()
            .await
            .map_err(|e| PipelineError::upstream(url, e))?;

        let devices = parse_device_list(&text);
        if devices.is_empty() {
            return Err(PipelineError::upstream(url, "roster lists no devices"));
        }
        Ok(devices)
    }

    #[instrument(skip(self), fields(channel = %self.channel))]
    pub async fn fetch_manifest(&self, device: &str) -> PipelineResult<ParsedManifest> {
        let url = self.manifest_url(device);
        let body = self
            .get_ok(&url)
            .await?
            .bytes()
            .await
            .map_err(|e| PipelineError::upstream(&url, e))?;
        Ok(ParsedManifest::parse(&body)?)
    }

    /// Lazily fetch manifests for `devices`, at most `concurrency` at a time.
    ///
    /// Each item carries its own result; one device failing never ends
    /// the stream.
    pub fn manifests(
        &self,
        devices: Vec<DeviceTarget>,
        concurrency: usize,
    ) -> impl Stream<Item = DeviceManifest> + '_ {
        stream::iter(devices)
            .map(move |target| async move {
                let manifest = self.fetch_manifest(&target.device).await;
                DeviceManifest {
                    device: target.device,
                    refresh_only: target.refresh_only,
                    manifest,
                }
            })
            .buffer_unordered(concurrency.max(1))
    }
}
