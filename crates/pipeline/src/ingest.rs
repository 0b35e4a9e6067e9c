//! One ingest sweep: roster, manifests, verified downloads, then prune.

use crate::error::{PipelineError, PipelineResult};
use crate::fetcher::{DeviceManifest, DeviceTarget, ManifestFetcher};
use crate::local_store::{BuildRecord, LocalStore};
use crate::retention::{ActiveJobs, PruneReport, RetentionManager};
use crate::verifier::IntegrityVerifier;
use futures::StreamExt;
use mirror_core::config::{AppConfig, RetentionConfig};
use mirror_core::{ManifestEntry, artifact_key};
use mirror_signer::SignatureVerifier;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Counters for one sweep. Failures are counted, never propagated.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub devices: usize,
    pub failed_devices: Vec<String>,
    pub ingested: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub hash_mismatch: u64,
    pub signature_invalid: u64,
    pub failed: u64,
    /// `None` when the sweep was cancelled before pruning.
    pub prune: Option<PruneReport>,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.failed_devices.extend(other.failed_devices);
        self.ingested += other.ingested;
        self.skipped += other.skipped;
        self.malformed += other.malformed;
        self.hash_mismatch += other.hash_mismatch;
        self.signature_invalid += other.signature_invalid;
        self.failed += other.failed;
    }

    fn record_failure(&mut self, err: &PipelineError) {
        match err {
            PipelineError::HashMismatch { .. } | PipelineError::SizeMismatch { .. } => {
                self.hash_mismatch += 1
            }
            PipelineError::SignatureInvalid { .. } => self.signature_invalid += 1,
            PipelineError::ManifestMalformed(_) | PipelineError::InvalidArtifact(_) => {
                self.malformed += 1
            }
            _ => self.failed += 1,
        }
    }
}

pub struct Ingestor {
    fetcher: ManifestFetcher,
    verifier: IntegrityVerifier,
    local: Arc<LocalStore>,
    retention: RetentionManager,
    policy: RetentionConfig,
    max_concurrent_devices: usize,
}

impl Ingestor {
    pub fn new(
        config: &AppConfig,
        local: Arc<LocalStore>,
        signatures: Arc<dyn SignatureVerifier>,
        jobs: Arc<dyn ActiveJobs>,
    ) -> PipelineResult<Self> {
        let fetcher = ManifestFetcher::new(&config.upstream)?;
        let verifier = IntegrityVerifier::new(
            fetcher.client().clone(),
            signatures,
            config.upstream.download_attempts,
        );
        Ok(Self {
            fetcher,
            verifier,
            retention: RetentionManager::new(local.clone(), jobs),
            local,
            policy: config.retention.clone(),
            max_concurrent_devices: config.upstream.max_concurrent_devices,
        })
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// Run one ingest cycle followed by a prune pass.
    ///
    /// Fails only when no device list can be obtained at all.
    #[instrument(skip(self, cancel))]
    pub async fn sweep(&self, cancel: &CancellationToken) -> PipelineResult<SweepReport> {
        let devices = self.devices().await?;
        let mut report = SweepReport {
            devices: devices.len(),
            ..SweepReport::default()
        };

        let per_device: Vec<SweepReport> = self
            .fetcher
            .manifests(devices, self.max_concurrent_devices)
            .take_until(cancel.cancelled())
            .map(|fetched| self.ingest_device(fetched, cancel))
            .buffer_unordered(self.max_concurrent_devices.max(1))
            .collect()
            .await;
        for device_report in per_device {
            report.merge(device_report);
        }

        if cancel.is_cancelled() {
            tracing::info!("Sweep cancelled, skipping prune");
            return Ok(report);
        }

        // Every ingest of this sweep has settled; nothing is mid-download.
        report.prune = Some(
            self.retention
                .prune(self.policy.retain, self.policy.dry_run)
                .await?,
        );

        tracing::info!(
            devices = report.devices,
            failed_devices = report.failed_devices.len(),
            ingested = report.ingested,
            skipped = report.skipped,
            hash_mismatch = report.hash_mismatch,
            signature_invalid = report.signature_invalid,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Roster devices, plus devices still listed upstream that left the
    /// roster. The latter only get their upstream flags refreshed.
    async fn devices(&self) -> PipelineResult<Vec<DeviceTarget>> {
        let known = self.local.metadata().upstream_devices().await?;
        let roster: BTreeSet<String> = match self.fetcher.fetch_devices().await {
            Ok(roster) => roster.into_iter().collect(),
            Err(e) if !known.is_empty() => {
                tracing::warn!(error = %e, "Device roster unavailable, refreshing known devices only");
                BTreeSet::new()
            }
            Err(e) => return Err(e),
        };

        let refresh: BTreeSet<String> = known
            .into_iter()
            .filter(|device| !roster.contains(device))
            .collect();
        Ok(roster
            .into_iter()
            .map(DeviceTarget::mirrored)
            .chain(refresh.into_iter().map(DeviceTarget::refresh_only))
            .collect())
    }

    #[instrument(skip(self, fetched, cancel), fields(device = %fetched.device))]
    async fn ingest_device(&self, fetched: DeviceManifest, cancel: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();
        let device = fetched.device;

        let manifest = match fetched.manifest {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(error = %e, "Manifest unavailable, keeping previous state");
                report.failed_devices.push(device);
                return report;
            }
        };

        for rejected in &manifest.rejected {
            tracing::warn!(reason = %rejected, "Skipping malformed manifest entry");
            report.malformed += 1;
        }

        match self
            .local
            .metadata()
            .set_upstream_availability(&device, &manifest.filenames())
            .await
        {
            Ok(flagged) => tracing::debug!(flagged, "Updated upstream availability"),
            Err(e) => tracing::warn!(error = %e, "Failed to update upstream availability"),
        }

        if fetched.refresh_only {
            tracing::debug!("Device left the roster, not downloading");
            return report;
        }

        for entry in manifest.newest_first() {
            if cancel.is_cancelled() {
                break;
            }
            match self.ingest_entry(&device, &entry, cancel).await {
                Ok(true) => report.ingested += 1,
                Ok(false) => report.skipped += 1,
                Err(PipelineError::Cancelled) => break,
                Err(e) => {
                    tracing::warn!(filename = %entry.filename, error = %e, "Rejected build");
                    report.record_failure(&e);
                }
            }
        }
        report
    }

    /// Download, verify and store one entry. `Ok(false)` if already held
    /// or already recorded.
    async fn ingest_entry(
        &self,
        device: &str,
        entry: &ManifestEntry,
        cancel: &CancellationToken,
    ) -> PipelineResult<bool> {
        let key = artifact_key(device, &entry.version, &entry.filename)?;
        if self.local.contains(&key).await? {
            return Ok(false);
        }
        let known = self
            .local
            .metadata()
            .find_build_by_identity(device, &entry.version, &entry.filename, &entry.sha256)
            .await?;
        if known.is_some() {
            return Ok(false);
        }

        tracing::info!(filename = %entry.filename, size = entry.size, "Downloading build");
        let record = BuildRecord::from_entry(device, entry)?;
        let verified = self
            .verifier
            .verify(entry, &key, self.local.staging(), cancel)
            .await?;
        self.local.put(record, verified).await?;
        Ok(true)
    }
}
