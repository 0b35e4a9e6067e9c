//! Periodic ingest and retention sweeps.

use crate::metrics;
use mirror_pipeline::{Ingestor, SweepReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run one sweep and record its outcome. Errors are logged, not returned.
pub async fn run_sweep(ingestor: &Ingestor, cancel: &CancellationToken) -> Option<SweepReport> {
    let started = Instant::now();
    match ingestor.sweep(cancel).await {
        Ok(report) => {
            metrics::record_sweep(&report, started.elapsed());
            if let Some(prune) = &report.prune {
                tracing::info!(skipped_active = prune.skipped_active, "{prune}");
            }
            Some(report)
        }
        Err(e) => {
            metrics::SWEEPS_FAILED.inc();
            tracing::error!(error = %e, "Sweep failed");
            None
        }
    }
}

/// Sweep every `interval`, starting immediately.
///
/// Each sweep runs to completion before the next tick is awaited, so
/// sweeps never overlap. Ticks missed while a sweep runs are skipped.
pub fn spawn_scheduler(
    ingestor: Arc<Ingestor>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "Sweep scheduler enabled");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            run_sweep(&ingestor, &cancel).await;
        }

        tracing::info!("Sweep scheduler stopped");
    })
}
