//! Object storage bucket destination with search index refresh.
//!
//! A group owns the folder `<bucket>/<group>/`. Uploading a group deletes
//! every object under that prefix, uploads each artifact named in the
//! metadata log, then uploads the log itself. Refreshing the search index
//! asks the group's data store to import that log with full reconciliation,
//! so documents dropped from the crawl disappear from search as well.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, instrument};

use super::{UploadError, UploadSummary, Uploader};
use crate::config::{ObjectStorageConfig, SearchIndexConfig};
use crate::fetch::{ApiClient, Auth, FetchError, LinkPage, RetryPolicy, fetch_link_pages};
use crate::output::{METADATA_LOG_FILE, MetadataRecord, OutputStore};

/// Content type of the uploaded metadata log.
const METADATA_LOG_MIME: &str = "application/x-ndjson";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectListing {
    #[serde(default)]
    items: Vec<StoredObject>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoredObject {
    name: String,
}

/// Replaces a group's bucket folder and re-imports its search data store.
#[derive(Debug)]
pub struct ObjectStorageUploader {
    client: ApiClient,
    storage_base: String,
    bucket: String,
    search_index: Option<SearchIndexConfig>,
    output: Arc<OutputStore>,
    retry: RetryPolicy,
}

impl ObjectStorageUploader {
    /// Builds an uploader for the `[object_storage]` section.
    ///
    /// # Errors
    ///
    /// [`UploadError::Credentials`] when the token cannot be resolved and
    /// [`UploadError::Fetch`] when the base URL is invalid.
    pub fn new(
        config: &ObjectStorageConfig,
        output: Arc<OutputStore>,
        retry: RetryPolicy,
    ) -> Result<Self, UploadError> {
        let client = ApiClient::new(&config.base_url, Auth::Bearer(config.token.resolve()?))?;
        Ok(Self {
            client,
            storage_base: config.base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            search_index: config.search_index.clone(),
            output,
            retry,
        })
    }

    /// `gs://` URI of the uploaded metadata log of `group`.
    #[must_use]
    pub fn metadata_log_uri(&self, group: &str) -> String {
        format!(
            "gs://{}/{}",
            self.bucket,
            self.output.object_name(group, METADATA_LOG_FILE)
        )
    }

    /// Deletes every object under `group`'s folder, returning how many were removed.
    ///
    /// # Errors
    ///
    /// [`UploadError::Fetch`] when the listing or a deletion fails after retries.
    #[instrument(skip(self))]
    pub async fn purge(&self, group: &str) -> Result<usize, UploadError> {
        let prefix = self.output.object_name(group, "");
        let objects_url = self.objects_url();
        let first = self
            .client
            .url_with_query(&objects_url, &[("prefix", prefix.as_str())])?;
        let client = &self.client;
        let listing_url = objects_url.as_str();
        let prefix_ref = prefix.as_str();
        let objects = self
            .retry
            .run("bucket listing", move || {
                fetch_link_pages(first.clone(), move |link| {
                    list_page(client, listing_url, prefix_ref, link)
                })
            })
            .await?;
        info!(objects = objects.len(), prefix = %prefix, "purging bucket folder");

        for object in &objects {
            let url = format!("{objects_url}/{}", urlencoding::encode(&object.name));
            self.retry
                .run("bucket delete", || client.delete(&url))
                .await?;
            debug!(object = %object.name, "deleted");
        }
        Ok(objects.len())
    }

    fn objects_url(&self) -> String {
        format!("{}/storage/v1/b/{}/o", self.storage_base, self.bucket)
    }

    async fn upload_object(
        &self,
        object_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), FetchError> {
        let url = self.client.url_with_query(
            &format!("{}/upload/storage/v1/b/{}/o", self.storage_base, self.bucket),
            &[("uploadType", "media"), ("name", object_name)],
        )?;
        self.retry
            .run("bucket upload", || {
                self.client
                    .post_bytes::<serde_json::Value>(&url, bytes.clone(), content_type)
            })
            .await
            .map(|_| ())
    }

    async fn upload_record(&self, group: &str, record: &MetadataRecord) -> Result<(), FetchError> {
        let file_name = record.file_name();
        let path = self.output.document_path(group, file_name);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FetchError::io(&path, e))?;
        let object = self.output.object_name(group, file_name);
        self.upload_object(&object, bytes, &record.content.mime_type)
            .await
    }
}

#[async_trait]
impl Uploader for ObjectStorageUploader {
    #[instrument(skip(self))]
    async fn upload_group(&self, group: &str) -> Result<UploadSummary, UploadError> {
        let purged = self.purge(group).await?;

        let records = self.output.read_metadata_records(group).await?;
        let mut summary = UploadSummary {
            artifacts: records.len(),
            purged,
            ..UploadSummary::default()
        };
        for record in &records {
            match self.upload_record(group, record).await {
                Ok(()) => summary.uploaded += 1,
                Err(e) => {
                    error!(group, id = %record.id, error = %e, "object upload failed");
                    summary.failed += 1;
                }
            }
        }

        let log_path = self.output.metadata_log_path(group);
        match tokio::fs::read(&log_path).await {
            Ok(bytes) => {
                let object = self.output.object_name(group, METADATA_LOG_FILE);
                self.upload_object(&object, bytes, METADATA_LOG_MIME).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(group, "no metadata log to upload");
            }
            Err(e) => return Err(FetchError::io(&log_path, e).into()),
        }

        info!(
            group,
            bucket = %self.bucket,
            uploaded = summary.uploaded,
            failed = summary.failed,
            purged,
            "bucket upload finished"
        );
        Ok(summary)
    }

    #[instrument(skip(self))]
    async fn refresh_search_index(&self, group: &str) -> Result<(), UploadError> {
        let Some(index) = &self.search_index else {
            return Ok(());
        };
        let Some(data_store) = index.data_stores.get(group) else {
            debug!(group, "no data store for group, skipping index refresh");
            return Ok(());
        };
        let url = format!(
            "{}/projects/{}/locations/{}/collections/default_collection/dataStores/{data_store}/branches/0/documents:import",
            index.base_url.trim_end_matches('/'),
            index.project_id,
            index.location,
        );
        let body = json!({
            "reconciliationMode": "FULL",
            "gcsSource": {
                "inputUris": [self.metadata_log_uri(group)],
                "dataSchema": "document",
            },
        });
        let operation: serde_json::Value = self
            .retry
            .run("index import", || self.client.post_json(&url, &body))
            .await?;
        info!(
            group,
            data_store = %data_store,
            operation = operation.get("name").and_then(serde_json::Value::as_str).unwrap_or_default(),
            "search index import started"
        );
        Ok(())
    }
}

async fn list_page(
    client: &ApiClient,
    objects_url: &str,
    prefix: &str,
    link: String,
) -> Result<LinkPage<StoredObject>, FetchError> {
    let listing: ObjectListing = client.get_json(&link).await?;
    let next = match listing.next_page_token {
        Some(token) if !token.is_empty() => Some(
            client.url_with_query(objects_url, &[("prefix", prefix), ("pageToken", token.as_str())])?,
        ),
        _ => None,
    };
    Ok(LinkPage {
        items: listing.items,
        next,
    })
}
