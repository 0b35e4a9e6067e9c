//! The download-verify-retain pipeline.
//!
//! A sweep fetches the device roster and per-device manifests
//! ([`ManifestFetcher`]), streams each new artifact through
//! [`IntegrityVerifier`] into a staged upload, commits verified bytes to
//! the [`LocalStore`], and finally lets [`RetentionManager`] enforce the
//! per-group cap. Nothing is written to the local store or the metadata
//! until an artifact has been fully verified.

pub mod error;
pub mod export;
pub mod fetcher;
pub mod import;
pub mod ingest;
pub mod local_store;
pub mod retention;
pub mod verifier;

pub use error::{PipelineError, PipelineResult};
pub use export::{ExportReport, export_promoted};
pub use fetcher::{DeviceManifest, DeviceTarget, ManifestFetcher};
pub use import::{ImportReport, SignaturePolicy, import_files};
pub use ingest::{Ingestor, SweepReport};
pub use local_store::{BuildRecord, LocalStore};
pub use retention::{ActiveJobs, NoActiveJobs, PruneReport, RetentionManager};
pub use verifier::{IntegrityVerifier, Verified, load_trusted_key};
