//! Moving promoted builds out of the local store.

use crate::error::PipelineResult;
use crate::local_store::LocalStore;
use mirror_metadata::BuildFilter;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct ExportReport {
    pub moved: Vec<PathBuf>,
    pub failed: Vec<(i64, String)>,
}

/// Move every build that is held both locally and remotely into `dir`.
pub async fn export_promoted(local: &LocalStore, dir: &Path) -> PipelineResult<ExportReport> {
    tokio::fs::create_dir_all(dir).await?;

    let held = local
        .metadata()
        .list_builds(&BuildFilter {
            stored: Some(true),
            ..BuildFilter::default()
        })
        .await?;

    let mut report = ExportReport::default();
    for row in held.iter().filter(|r| r.remote_url.is_some()) {
        match local.move_out(row, dir).await {
            Ok(Some(dest)) => {
                tracing::info!(id = row.id, dest = %dest.display(), "Exported build");
                report.moved.push(dest);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(id = row.id, error = %e, "Failed to export build");
                report.failed.push((row.id, e.to_string()));
            }
        }
    }
    Ok(report)
}
