//! Prometheus metrics for the mirror daemon.
//!
//! Exposes counters for sweeps (ingest outcomes, retention) and for the
//! promotion pipeline (jobs started, retried, completed and failed).
//!
//! The `/metrics` endpoint is unauthenticated and only mounted when
//! `server.metrics_enabled` is set. Restrict it at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use mirror_pipeline::SweepReport;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};
use std::time::Duration;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Sweep metrics
pub static SWEEPS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_sweeps_completed_total",
        "Total number of sweeps that ran to completion",
    )
    .expect("metric creation failed")
});

pub static SWEEPS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_sweeps_failed_total",
        "Total number of sweeps that aborted with an error",
    )
    .expect("metric creation failed")
});

pub static SWEEP_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "mirror_sweep_duration_seconds",
            "Time taken by one ingest and retention sweep",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
    )
    .expect("metric creation failed")
});

pub static BUILDS_INGESTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_builds_ingested_total",
        "Total number of builds downloaded, verified and stored locally",
    )
    .expect("metric creation failed")
});

pub static BUILDS_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mirror_builds_rejected_total",
            "Total upstream builds rejected by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static UPSTREAM_DEVICE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_upstream_device_failures_total",
        "Total device manifest fetches that failed",
    )
    .expect("metric creation failed")
});

pub static BUILDS_PRUNED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_builds_pruned_total",
        "Total number of local copies removed by retention",
    )
    .expect("metric creation failed")
});

pub static BYTES_PRUNED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_bytes_pruned_total",
        "Total bytes reclaimed by retention",
    )
    .expect("metric creation failed")
});

// Promotion metrics
pub static UPLOADS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_uploads_started_total",
        "Total number of promotion jobs admitted",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_uploads_completed_total",
        "Total number of builds promoted to remote storage",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_uploads_failed_total",
        "Total number of promotion jobs that exhausted their attempts",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_RETRIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_uploads_retried_total",
        "Total number of promotion transfer retries",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mirror_bytes_uploaded_total",
        "Total bytes committed to remote storage",
    )
    .expect("metric creation failed")
});

pub static ACTIVE_UPLOADS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "mirror_active_uploads",
        "Number of promotion jobs currently queued or uploading",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(SWEEPS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEPS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEP_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BUILDS_INGESTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BUILDS_REJECTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPSTREAM_DEVICE_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BUILDS_PRUNED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_PRUNED.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(UPLOADS_STARTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_RETRIED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_UPLOADS.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Fold a finished sweep into the counters.
pub fn record_sweep(report: &SweepReport, elapsed: Duration) {
    SWEEPS_COMPLETED.inc();
    SWEEP_DURATION.observe(elapsed.as_secs_f64());
    BUILDS_INGESTED.inc_by(report.ingested);
    UPSTREAM_DEVICE_FAILURES.inc_by(report.failed_devices.len() as u64);

    for (reason, count) in [
        ("malformed", report.malformed),
        ("hash_mismatch", report.hash_mismatch),
        ("signature_invalid", report.signature_invalid),
        ("failed", report.failed),
    ] {
        if count > 0 {
            BUILDS_REJECTED.with_label_values(&[reason]).inc_by(count);
        }
    }

    if let Some(prune) = &report.prune
        && !prune.dry_run
    {
        BUILDS_PRUNED.inc_by(prune.count() as u64);
        BYTES_PRUNED.inc_by(prune.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_pipeline::PruneReport;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_record_sweep_ignores_dry_run_prune() {
        register_metrics();
        let pruned_before = BUILDS_PRUNED.get();
        let ingested_before = BUILDS_INGESTED.get();

        let report = SweepReport {
            ingested: 2,
            hash_mismatch: 1,
            prune: Some(PruneReport {
                pruned: vec![mirror_core::BuildId::new(1)],
                bytes: 10,
                skipped_active: 0,
                dry_run: true,
            }),
            ..SweepReport::default()
        };
        record_sweep(&report, Duration::from_millis(5));

        assert!(BUILDS_INGESTED.get() >= ingested_before + 2);
        assert_eq!(BUILDS_PRUNED.get(), pruned_before);
    }
}
