//! HTTP portal and promotion service for the nightly build mirror.
//!
//! This crate provides:
//! - Build listings and statistics for the portal UI
//! - The upload orchestrator that promotes local builds to remote storage
//! - The periodic ingest and retention scheduler
//! - Prometheus metrics

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod uploads;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
pub use uploads::{Admission, Ineligible, UploadError, UploadOrchestrator};
