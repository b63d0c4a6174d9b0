//! Upload handoff run once per group after all its targets settle.
//!
//! - [`LocalUploader`] - keeps the artifacts on disk and reports their count
//! - [`DatasetUploader`] - snapshots, purges and re-uploads a remote dataset
//! - [`ObjectStorageUploader`] - replaces a bucket folder and re-imports the
//!   group's search data store

mod dataset;
mod object_store;

pub use dataset::{DatasetUploader, PURGE_PAGE_SIZE};
pub use object_store::ObjectStorageUploader;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::ConfigError;
use crate::fetch::FetchError;
use crate::output::{OutputError, OutputStore};
use crate::snapshot::SnapshotError;

/// Upload errors.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Purging, uploading or re-indexing on the remote side failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Local artifacts could not be read.
    #[error(transparent)]
    Output(#[from] OutputError),

    /// The relational snapshot could not be written.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Credentials could not be resolved.
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] ConfigError),

    /// The group has no dataset assigned.
    #[error("no dataset configured for group '{group}'")]
    NoDataset {
        /// Group name.
        group: String,
    },
}

/// What one group upload did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    /// Artifacts named in the metadata log.
    pub artifacts: usize,
    /// Artifacts accepted by the destination.
    pub uploaded: usize,
    /// Artifacts the destination rejected after retries.
    pub failed: usize,
    /// Remote documents deleted before uploading.
    pub purged: usize,
}

/// Destination a group's output is handed to.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads everything `group` produced in this run.
    async fn upload_group(&self, group: &str) -> Result<UploadSummary, UploadError>;

    /// Asks the destination to re-index `group`. Most destinations index on upload.
    async fn refresh_search_index(&self, _group: &str) -> Result<(), UploadError> {
        Ok(())
    }
}

/// Keeps artifacts on disk.
#[derive(Debug, Clone)]
pub struct LocalUploader {
    output: Arc<OutputStore>,
}

impl LocalUploader {
    #[must_use]
    pub fn new(output: Arc<OutputStore>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    async fn upload_group(&self, group: &str) -> Result<UploadSummary, UploadError> {
        let artifacts = self.output.read_metadata_records(group).await?.len();
        info!(
            group,
            artifacts,
            dir = %self.output.group_dir(group).display(),
            "output kept locally"
        );
        Ok(UploadSummary {
            artifacts,
            ..UploadSummary::default()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::output::MetadataRecord;

    #[tokio::test]
    async fn test_local_uploader_counts_artifacts() {
        let temp = tempfile::tempdir().unwrap();
        let output = Arc::new(OutputStore::new(temp.path()));
        for id in ["a", "b", "c"] {
            let record = MetadataRecord::new(id, id, "u", "t", "text/html", format!("g/{id}.html"));
            output.append_metadata_record("g", &record).await.unwrap();
        }

        let uploader = LocalUploader::new(output);
        let summary = uploader.upload_group("g").await.unwrap();
        assert_eq!(summary.artifacts, 3);
        assert_eq!(summary.uploaded, 0);
        uploader.refresh_search_index("g").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_uploader_empty_group() {
        let temp = tempfile::tempdir().unwrap();
        let uploader = LocalUploader::new(Arc::new(OutputStore::new(temp.path())));
        assert_eq!(uploader.upload_group("none").await.unwrap(), UploadSummary::default());
    }
}
