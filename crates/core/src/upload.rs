//! Promotion job lifecycle types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a promotion job for one build.
///
/// `NotQueued -> Queued -> Uploading -> {Done, Failed}`. Jobs are not
/// persisted; `NotQueued` is the state of every build without a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    NotQueued,
    /// Admitted and waiting for a worker permit.
    Queued,
    /// A worker is streaming bytes to the remote store.
    Uploading,
    /// Remote copy recorded; job leaves the registry.
    Done,
    /// Retries exhausted; job lingers briefly with its error.
    Failed,
}

impl UploadState {
    /// Queued or uploading. At most one active job may exist per build.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Uploading)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        matches!(
            (self, next),
            (Self::NotQueued, Self::Queued)
                | (Self::Queued, Self::Uploading)
                | (Self::Queued, Self::Failed)
                | (Self::Uploading, Self::Done)
                | (Self::Uploading, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotQueued => "not_queued",
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot of a promotion job, as served to pollers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub progress: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadProgress {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}
