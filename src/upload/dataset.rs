//! Remote knowledge-base dataset destination.
//!
//! A group upload runs in four steps: write the relational snapshot, delete
//! every document already in the group's dataset, pause so the deletions
//! settle, then upload each artifact named in the metadata log. Uploads are
//! throttled by a shared [`RateLimiter`] and each one is retried on its own.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, error, info, instrument};

use super::{UploadError, UploadSummary, Uploader};
use crate::config::DatasetConfig;
use crate::fetch::{
    ApiClient, Auth, FetchError, NumberedPage, RateLimiter, RetryPolicy, fetch_numbered_pages,
};
use crate::output::{MetadataRecord, OutputStore};
use crate::snapshot::convert_metadata_log;

/// Documents requested per listing page while purging.
pub const PURGE_PAGE_SIZE: u32 = 100;

/// Pause between document deletions (300ms).
const DELETE_PAUSE: Duration = Duration::from_millis(300);

#[derive(Debug, Deserialize)]
struct DocumentPage {
    #[serde(default)]
    data: Vec<RemoteDocument>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct RemoteDocument {
    id: String,
}

/// Uploads groups into their configured datasets.
#[derive(Debug)]
pub struct DatasetUploader {
    client: ApiClient,
    base_url: String,
    dataset_ids: BTreeMap<String, String>,
    output: Arc<OutputStore>,
    retry: RetryPolicy,
    limiter: RateLimiter,
    settle_delay: Duration,
    delete_pause: Duration,
}

impl DatasetUploader {
    /// Builds an uploader for the `[dataset]` section.
    ///
    /// # Errors
    ///
    /// [`UploadError::Credentials`] when the API key cannot be resolved and
    /// [`UploadError::Fetch`] when the base URL is invalid.
    pub fn new(
        config: &DatasetConfig,
        dataset_ids: BTreeMap<String, String>,
        output: Arc<OutputStore>,
        retry: RetryPolicy,
    ) -> Result<Self, UploadError> {
        let client = ApiClient::new(&config.base_url, Auth::Bearer(config.api_key.resolve()?))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dataset_ids,
            output,
            retry,
            limiter: RateLimiter::new(config.rate_per_minute),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            delete_pause: DELETE_PAUSE,
        })
    }

    /// Overrides the pause between deletions.
    #[must_use]
    pub fn with_delete_pause(mut self, pause: Duration) -> Self {
        self.delete_pause = pause;
        self
    }

    /// Deletes every document in `dataset_id`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// [`UploadError::Fetch`] when the listing or a deletion fails after retries.
    #[instrument(skip(self))]
    pub async fn purge(&self, dataset_id: &str) -> Result<usize, UploadError> {
        let documents_url = format!("{}/datasets/{dataset_id}/documents", self.base_url);
        let client = &self.client;
        let listing_url = documents_url.as_str();
        let documents = self
            .retry
            .run("dataset listing", move || {
                fetch_numbered_pages(move |page| list_page(client, listing_url, page))
            })
            .await?;
        info!(documents = documents.len(), "purging dataset");

        for document in &documents {
            let url = format!("{documents_url}/{}", document.id);
            self.retry
                .run("dataset delete", || client.delete(&url))
                .await?;
            debug!(document = %document.id, "deleted");
            tokio::time::sleep(self.delete_pause).await;
        }
        Ok(documents.len())
    }

    async fn upload_record(
        &self,
        dataset_id: &str,
        group: &str,
        record: &MetadataRecord,
    ) -> Result<(), FetchError> {
        let file_name = record.file_name();
        let path = self.output.document_path(group, file_name);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FetchError::io(&path, e))?;
        let url = format!("{}/datasets/{dataset_id}/document/create_by_file", self.base_url);
        let data = serde_json::json!({
            "name": record.struct_data.title,
            "indexing_technique": "high_quality",
            "process_rule": { "mode": "automatic" },
        })
        .to_string();

        self.retry
            .run("dataset upload", || async {
                self.limiter.acquire().await;
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.to_string())
                    .mime_str(&record.content.mime_type)
                    .map_err(|e| FetchError::network(url.as_str(), e))?;
                let form = Form::new().part("file", part).text("data", data.clone());
                self.client
                    .post_multipart::<serde_json::Value>(&url, form)
                    .await
                    .map(|_| ())
            })
            .await
    }
}

#[async_trait]
impl Uploader for DatasetUploader {
    #[instrument(skip(self))]
    async fn upload_group(&self, group: &str) -> Result<UploadSummary, UploadError> {
        let dataset_id = self
            .dataset_ids
            .get(group)
            .ok_or_else(|| UploadError::NoDataset {
                group: group.to_string(),
            })?;

        convert_metadata_log(&self.output, group).await?;
        let purged = self.purge(dataset_id).await?;
        tokio::time::sleep(self.settle_delay).await;

        let records = self.output.read_metadata_records(group).await?;
        let mut summary = UploadSummary {
            artifacts: records.len(),
            purged,
            ..UploadSummary::default()
        };
        for record in &records {
            match self.upload_record(dataset_id, group, record).await {
                Ok(()) => summary.uploaded += 1,
                Err(e) => {
                    error!(group, id = %record.id, error = %e, "upload failed");
                    summary.failed += 1;
                }
            }
        }
        info!(
            group,
            uploaded = summary.uploaded,
            failed = summary.failed,
            purged,
            "dataset upload finished"
        );
        Ok(summary)
    }
}

async fn list_page(
    client: &ApiClient,
    documents_url: &str,
    page: u32,
) -> Result<NumberedPage<RemoteDocument>, FetchError> {
    let page_number = page.to_string();
    let limit = PURGE_PAGE_SIZE.to_string();
    let url = client.url_with_query(documents_url, &[("page", &page_number), ("limit", &limit)])?;
    let body: DocumentPage = client.get_json(&url).await?;
    Ok(NumberedPage {
        items: body.data,
        has_more: body.has_more,
    })
}
