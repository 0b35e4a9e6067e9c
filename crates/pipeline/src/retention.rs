//! Retention cap enforcement for the local cache.

use crate::error::PipelineResult;
use crate::local_store::LocalStore;
use mirror_core::{BuildId, MIB};
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

/// Builds with a promotion job in flight. Pruning never selects them.
pub trait ActiveJobs: Send + Sync {
    fn is_active(&self, id: BuildId) -> bool;
}

/// No promotion jobs exist (offline tools).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoActiveJobs;

impl ActiveJobs for NoActiveJobs {
    fn is_active(&self, _id: BuildId) -> bool {
        false
    }
}

/// Outcome of one prune pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub pruned: Vec<BuildId>,
    pub bytes: u64,
    /// Candidates left alone because a promotion job was active.
    pub skipped_active: u64,
    pub dry_run: bool,
}

impl PruneReport {
    pub fn count(&self) -> usize {
        self.pruned.len()
    }

    pub fn mib(&self) -> u64 {
        self.bytes / MIB
    }
}

impl fmt::Display for PruneReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.dry_run { "Would remove" } else { "Removed" };
        write!(
            f,
            "{verb} {} builds with a combined size of {} MiB",
            self.count(),
            self.mib()
        )
    }
}

pub struct RetentionManager {
    local: Arc<LocalStore>,
    jobs: Arc<dyn ActiveJobs>,
}

impl RetentionManager {
    pub fn new(local: Arc<LocalStore>, jobs: Arc<dyn ActiveJobs>) -> Self {
        Self { local, jobs }
    }

    /// Keep at most `retain` local copies per (device, version).
    ///
    /// `None` keeps everything. Remote copies are never touched.
    #[instrument(skip(self))]
    pub async fn prune(&self, retain: Option<u32>, dry_run: bool) -> PipelineResult<PruneReport> {
        let mut report = PruneReport {
            dry_run,
            ..PruneReport::default()
        };
        let Some(retain) = retain else {
            return Ok(report);
        };

        for (device, version) in self.local.metadata().stored_groups().await? {
            let held = self.local.list(&device, &version).await?;
            for row in held.iter().skip(retain as usize) {
                if self.jobs.is_active(row.build_id()) {
                    tracing::info!(id = row.id, "Upload in progress, not pruning");
                    report.skipped_active += 1;
                    continue;
                }
                tracing::info!(
                    id = row.id,
                    device = %device,
                    version = %version,
                    filename = %row.filename,
                    dry_run,
                    "Pruning build"
                );
                if !dry_run {
                    self.local.remove(row).await?;
                }
                report.pruned.push(row.build_id());
                report.bytes += row.size_bytes();
            }
        }

        tracing::info!(
            count = report.count(),
            mib = report.mib(),
            dry_run,
            "{report}"
        );
        Ok(report)
    }
}
