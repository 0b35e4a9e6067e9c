//! Promotion of locally held builds to remote storage.
//!
//! Jobs live only in memory. Admission goes through the registry's entry
//! API, so concurrent requests for the same build yield one job. Workers
//! are bounded by a semaphore and stream from the local cache into a
//! staged remote upload; the build's `remote_url` is written only after
//! the remote store has committed the object.

use crate::metrics;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use mirror_core::config::UploadConfig;
use mirror_core::{BuildAvailability, BuildId, UploadProgress, UploadState};
use mirror_metadata::{BuildUpsert, MetadataError, Patch};
use mirror_pipeline::{ActiveJobs, LocalStore};
use mirror_storage::{ByteStream, ObjectStore, StorageError, StreamingUpload};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// Why a build cannot be promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ineligible {
    #[error("Build ID is unknown")]
    Unknown,
    #[error("Build is not available")]
    NotLocal,
    #[error("Build is already available remotely")]
    AlreadyRemote,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    NotEligible(Ineligible),

    #[error("Build ID not in upload queue")]
    NotFound,

    #[error("upload transport failure: {0}")]
    Transport(#[from] StorageError),

    #[error("local copy is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_transient())
    }
}

/// Outcome of an upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// A job for this build was already queued or uploading.
    AlreadyQueued,
}

#[derive(Debug, Clone)]
struct UploadJob {
    /// Distinguishes a replacement job from the failed one it replaced.
    generation: u64,
    state: UploadState,
    progress: u64,
    size: u64,
    error: Option<String>,
}

impl UploadJob {
    fn queued(generation: u64, size: u64) -> Self {
        Self {
            generation,
            state: UploadState::Queued,
            progress: 0,
            size,
            error: None,
        }
    }

    /// Progress never decreases and stays below `size` until the job is done.
    fn advance(&mut self, bytes: u64) {
        let ceiling = self.size.saturating_sub(1);
        self.progress = self.progress.max(bytes.min(ceiling));
    }

    fn transition(&mut self, next: UploadState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            tracing::warn!(from = %self.state, to = %next, "Ignoring invalid job transition");
        }
    }

    fn snapshot(&self) -> UploadProgress {
        UploadProgress {
            progress: self.progress,
            size: self.size,
            error: self.error.clone(),
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)))
}

struct Inner {
    jobs: DashMap<BuildId, UploadJob>,
    local: Arc<LocalStore>,
    remote: Arc<dyn ObjectStore>,
    bucket: String,
    config: UploadConfig,
    workers: Arc<Semaphore>,
    generation: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Registry and worker pool for promotion jobs.
#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
}

impl UploadOrchestrator {
    pub fn new(
        local: Arc<LocalStore>,
        remote: Arc<dyn ObjectStore>,
        bucket: String,
        config: UploadConfig,
        cancel: CancellationToken,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                jobs: DashMap::new(),
                local,
                remote,
                bucket,
                config,
                workers,
                generation: AtomicU64::new(0),
                cancel,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Admit a promotion job for `id`.
    ///
    /// Idempotent while a job is active. A failed job that is still
    /// visible is replaced by a fresh one.
    #[instrument(skip(self))]
    pub async fn request(&self, id: BuildId) -> Result<Admission, UploadError> {
        let row = self
            .inner
            .local
            .metadata()
            .find_build(id)
            .await?
            .ok_or(UploadError::NotEligible(Ineligible::Unknown))?;

        match row.availability() {
            BuildAvailability::Remote(_) => {
                return Err(UploadError::NotEligible(Ineligible::AlreadyRemote));
            }
            BuildAvailability::Superseded => {
                return Err(UploadError::NotEligible(Ineligible::NotLocal));
            }
            BuildAvailability::Local(_) => {}
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let job = UploadJob::queued(generation, row.size_bytes());
        match self.inner.jobs.entry(id) {
            Entry::Occupied(entry) if entry.get().state.is_active() => {
                tracing::debug!("Upload already queued");
                return Ok(Admission::AlreadyQueued);
            }
            Entry::Occupied(mut entry) => {
                entry.insert(job);
            }
            Entry::Vacant(entry) => {
                entry.insert(job);
            }
        }

        metrics::UPLOADS_STARTED.inc();
        metrics::ACTIVE_UPLOADS.inc();
        tracing::info!(filename = %row.filename, size = row.size, "Queued upload");

        let inner = self.inner.clone();
        self.inner.tasks.spawn(inner.run(id, generation));
        Ok(Admission::Queued)
    }

    /// Snapshot of the job for `id`, active or recently failed.
    pub fn progress(&self, id: BuildId) -> Result<UploadProgress, UploadError> {
        self.inner
            .jobs
            .get(&id)
            .map(|job| job.snapshot())
            .ok_or(UploadError::NotFound)
    }

    /// Ids of queued or uploading jobs, ascending.
    pub fn active(&self) -> Vec<BuildId> {
        let mut ids: Vec<BuildId> = self
            .inner
            .jobs
            .iter()
            .filter(|job| job.state.is_active())
            .map(|job| *job.key())
            .collect();
        ids.sort();
        ids
    }

    /// Cancel all workers and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl ActiveJobs for UploadOrchestrator {
    fn is_active(&self, id: BuildId) -> bool {
        self.inner
            .jobs
            .get(&id)
            .is_some_and(|job| job.state.is_active())
    }
}

impl Inner {
    async fn run(self: Arc<Self>, id: BuildId, generation: u64) {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.workers.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.discard(id, generation);
            return;
        };
        self.update(id, generation, |job| job.transition(UploadState::Uploading));

        let mut attempt = 1;
        loop {
            match self.transfer(id, generation).await {
                Ok(url) => {
                    self.complete(id, generation, &url);
                    return;
                }
                Err(UploadError::Cancelled) => {
                    self.discard(id, generation);
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = backoff_delay(self.config.retry_backoff(), attempt);
                    tracing::warn!(
                        id = %id,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Upload attempt failed, retrying"
                    );
                    metrics::UPLOADS_RETRIED.inc();
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            self.discard(id, generation);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    self.fail(id, generation, e.to_string());
                    return;
                }
            }
        }
    }

    #[instrument(skip(self, generation))]
    async fn transfer(&self, id: BuildId, generation: u64) -> Result<String, UploadError> {
        let row = self
            .local
            .metadata()
            .find_build(id)
            .await?
            .ok_or(UploadError::NotEligible(Ineligible::Unknown))?;
        if let Some(url) = &row.remote_url {
            return Ok(url.clone());
        }
        let Some(key) = row.local_path.clone() else {
            return Err(UploadError::NotEligible(Ineligible::NotLocal));
        };

        let mut source = self.local.backend().get_stream(&key).await?;
        let mut upload = self.remote.put_stream(&row.filename).await?;

        if let Err(e) = self
            .pump(id, generation, &mut source, upload.as_mut())
            .await
        {
            abort_quietly(upload, &row.filename).await;
            return Err(e);
        }
        let written = upload.bytes_written();
        if written != row.size_bytes() {
            abort_quietly(upload, &row.filename).await;
            return Err(UploadError::SizeMismatch {
                expected: row.size_bytes(),
                actual: written,
            });
        }
        let written = upload.finish().await?;
        metrics::BYTES_UPLOADED.inc_by(written);

        let url = self.config.download_url_for(&self.bucket, &row.filename);
        self.local
            .metadata()
            .upsert_build(&BuildUpsert::storage_patch(
                &row,
                Patch::Keep,
                Patch::Set(url.clone()),
            ))
            .await?;
        Ok(url)
    }

    async fn pump(
        &self,
        id: BuildId,
        generation: u64,
        source: &mut ByteStream,
        upload: &mut dyn StreamingUpload,
    ) -> Result<(), UploadError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                next = source.next() => next,
            };
            let Some(chunk) = next else {
                return Ok(());
            };
            let chunk = chunk?;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                result = upload.write(chunk) => result?,
            }
            let written = upload.bytes_written();
            self.update(id, generation, |job| job.advance(written));
        }
    }

    /// Apply `f` to the job if it is still the one this worker owns.
    fn update(&self, id: BuildId, generation: u64, f: impl FnOnce(&mut UploadJob)) {
        if let Some(mut job) = self.jobs.get_mut(&id)
            && job.generation == generation
        {
            f(&mut job);
        }
    }

    fn complete(&self, id: BuildId, generation: u64, url: &str) {
        self.update(id, generation, |job| {
            job.transition(UploadState::Done);
            job.progress = job.size;
        });
        self.jobs.remove_if(&id, |_, job| job.generation == generation);
        metrics::UPLOADS_COMPLETED.inc();
        metrics::ACTIVE_UPLOADS.dec();
        tracing::info!(id = %id, url = %url, "Upload finished");
    }

    fn fail(self: &Arc<Self>, id: BuildId, generation: u64, message: String) {
        tracing::error!(id = %id, error = %message, "Upload failed");
        self.update(id, generation, |job| {
            job.transition(UploadState::Failed);
            job.error = Some(message);
        });
        metrics::UPLOADS_FAILED.inc();
        metrics::ACTIVE_UPLOADS.dec();

        let inner = self.clone();
        let visibility = self.config.failed_visibility();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(visibility) => {}
            }
            inner
                .jobs
                .remove_if(&id, |_, job| job.generation == generation);
        });
    }

    fn discard(&self, id: BuildId, generation: u64) {
        if self
            .jobs
            .remove_if(&id, |_, job| job.generation == generation)
            .is_some()
        {
            metrics::ACTIVE_UPLOADS.dec();
            tracing::info!(id = %id, "Upload cancelled");
        }
    }
}

async fn abort_quietly(upload: Box<dyn StreamingUpload>, key: &str) {
    if let Err(e) = upload.abort().await {
        tracing::warn!(key = %key, error = %e, "Failed to discard remote upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_capped_until_done() {
        let mut job = UploadJob::queued(0, 100);
        job.advance(40);
        assert_eq!(job.progress, 40);
        job.advance(10);
        assert_eq!(job.progress, 40);
        job.advance(100);
        assert_eq!(job.progress, 99);

        let mut empty = UploadJob::queued(0, 0);
        empty.advance(0);
        assert_eq!(empty.progress, 0);
    }

    #[test]
    fn test_job_transitions_follow_state_machine() {
        let mut job = UploadJob::queued(0, 10);
        job.transition(UploadState::Done);
        assert_eq!(job.state, UploadState::Queued);
        job.transition(UploadState::Uploading);
        job.transition(UploadState::Failed);
        assert_eq!(job.state, UploadState::Failed);
        job.transition(UploadState::Uploading);
        assert_eq!(job.state, UploadState::Failed);
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(800));
        assert!(backoff_delay(base, u32::MAX) >= backoff_delay(base, 17));
    }

    #[test]
    fn test_only_transient_storage_errors_retry() {
        let io = UploadError::Transport(StorageError::Io(std::io::Error::other("reset")));
        assert!(io.is_retryable());
        assert!(!UploadError::Transport(StorageError::NotFound("a.zip".into())).is_retryable());
        assert!(
            !UploadError::SizeMismatch {
                expected: 2,
                actual: 1
            }
            .is_retryable()
        );
    }
}
