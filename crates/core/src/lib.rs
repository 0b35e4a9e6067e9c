//! Core domain types shared by the nightly build mirror.
//!
//! This crate defines the data model used across all other crates:
//! - Build identity, availability and artifact filenames
//! - Upstream manifest entries and device rosters
//! - Artifact hash sets and incremental hashing
//! - Promotion job states and progress snapshots
//! - Configuration

pub mod build;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod upload;

pub use build::{BuildAvailability, BuildId, BuildName, artifact_key};
pub use error::{Error, Result};
pub use hash::{BuildHasher, BuildHashes};
pub use manifest::{ManifestEntry, ParsedManifest};
pub use upload::{UploadProgress, UploadState};

/// Read size used when streaming artifact bytes: 16 KiB
pub const DOWNLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Bytes per MiB, used for human-readable size reports.
pub const MIB: u64 = 1024 * 1024;
