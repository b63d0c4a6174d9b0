//! On-disk output for crawl groups.
//!
//! Every group owns a directory `<data_dir>/<group>/` holding one file per
//! artifact plus an append-only metadata log `0metadata.ndjson`. Appends to
//! one group's log are serialized behind an async mutex so concurrent
//! targets never interleave partial lines.
//!
//! Records point at their artifact through `content.uri`: `<group>/<file>`
//! by default, or `<prefix>/<group>/<file>` once a storage URI prefix such
//! as `gs://kb-docs` is set.

mod filename;
mod record;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use filename::{MAX_FILENAME_BYTES, build_filename, extension_of, sanitize_filename};
pub use record::{ContentDescriptor, MetadataRecord, StructData};

/// File name of each group's metadata log.
pub const METADATA_LOG_FILE: &str = "0metadata.ndjson";

/// Errors from the output store.
#[derive(Debug, Error)]
pub enum OutputError {
    /// File system error.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A metadata record could not be serialized.
    #[error("failed to serialize metadata record {id}: {source}")]
    Serialize {
        /// Id of the record.
        id: String,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl OutputError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// File-system writer shared by every target of every group.
#[derive(Debug)]
pub struct OutputStore {
    data_dir: PathBuf,
    uri_prefix: Option<String>,
    log_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OutputStore {
    /// Creates a store rooted at `data_dir`. Nothing is touched on disk yet.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            uri_prefix: None,
            log_locks: DashMap::new(),
        }
    }

    /// Prefixes every recorded `content.uri` with `prefix` (trailing `/` ignored).
    #[must_use]
    pub fn with_uri_prefix(mut self, prefix: Option<String>) -> Self {
        self.uri_prefix = prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());
        self
    }

    /// Root of all group directories.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding `group`'s artifacts.
    #[must_use]
    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.data_dir.join(sanitize_filename(group))
    }

    /// Path of `group`'s metadata log.
    #[must_use]
    pub fn metadata_log_path(&self, group: &str) -> PathBuf {
        self.group_dir(group).join(METADATA_LOG_FILE)
    }

    /// Deterministic artifact path for an already-built file name.
    #[must_use]
    pub fn document_path(&self, group: &str, file_name: &str) -> PathBuf {
        self.group_dir(group).join(file_name)
    }

    /// Key of an artifact inside a bucket or below the data directory.
    #[must_use]
    pub fn object_name(&self, group: &str, file_name: &str) -> String {
        format!("{}/{file_name}", sanitize_filename(group))
    }

    /// URI recorded in metadata for an artifact.
    #[must_use]
    pub fn document_uri(&self, group: &str, file_name: &str) -> String {
        let object = self.object_name(group, file_name);
        match &self.uri_prefix {
            Some(prefix) => format!("{prefix}/{object}"),
            None => object,
        }
    }

    /// Removes everything previously written for `group` and recreates its directory.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Io`] when the directory cannot be removed or created.
    pub async fn clear_group_output(&self, group: &str) -> Result<(), OutputError> {
        let dir = self.group_dir(group);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(dir = %dir.display(), "cleared group output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(OutputError::io(dir, e)),
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| OutputError::io(&dir, e))
    }

    /// Makes sure `group`'s directory exists, returning the artifact path for `file_name`.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Io`] when the directory cannot be created.
    pub async fn prepare_document_path(
        &self,
        group: &str,
        file_name: &str,
    ) -> Result<PathBuf, OutputError> {
        let dir = self.group_dir(group);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| OutputError::io(&dir, e))?;
        Ok(dir.join(file_name))
    }

    /// Writes `content` to `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Io`] on write failure.
    pub async fn save_document(&self, path: &Path, content: &[u8]) -> Result<(), OutputError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OutputError::io(parent, e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| OutputError::io(path, e))?;
        info!(path = %path.display(), bytes = content.len(), "saved document");
        Ok(())
    }

    /// Appends one record as a single NDJSON line to `group`'s metadata log.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Serialize`] or [`OutputError::Io`].
    pub async fn append_metadata_record(
        &self,
        group: &str,
        record: &MetadataRecord,
    ) -> Result<(), OutputError> {
        let mut line = serde_json::to_string(record).map_err(|source| OutputError::Serialize {
            id: record.id.clone(),
            source,
        })?;
        line.push('\n');

        let lock = self
            .log_locks
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let path = self.metadata_log_path(group);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OutputError::io(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| OutputError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| OutputError::io(&path, e))?;
        file.flush().await.map_err(|e| OutputError::io(&path, e))?;
        debug!(group, id = %record.id, "appended metadata record");
        Ok(())
    }

    /// Reads `group`'s metadata log in emission order.
    ///
    /// Lines that do not parse are logged and skipped. A missing log reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Io`] when the log exists but cannot be read.
    pub async fn read_metadata_records(
        &self,
        group: &str,
    ) -> Result<Vec<MetadataRecord>, OutputError> {
        let path = self.metadata_log_path(group);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OutputError::io(path, e)),
        };
        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MetadataRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(group, line = index + 1, error = %e, "skipping malformed metadata line"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(id: &str) -> MetadataRecord {
        MetadataRecord::new(id, "t", "u", "c", "text/html", format!("g/{id}.html"))
    }

    #[tokio::test]
    async fn test_clear_group_output_removes_previous_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = OutputStore::new(dir.path());
        let path = store.prepare_document_path("docs", "old.html").await.unwrap();
        store.save_document(&path, b"stale").await.unwrap();

        store.clear_group_output("docs").await.unwrap();

        assert!(!path.exists());
        assert!(store.group_dir("docs").is_dir());
    }

    #[tokio::test]
    async fn test_clear_group_output_missing_dir_is_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = OutputStore::new(dir.path().join("nested"));
        store.clear_group_output("fresh").await.unwrap();
        assert!(store.group_dir("fresh").is_dir());
    }

    #[tokio::test]
    async fn test_append_metadata_record_keeps_emission_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = OutputStore::new(dir.path());
        for id in ["a", "b", "c"] {
            store.append_metadata_record("g", &record(id)).await.unwrap();
        }
        let ids: Vec<_> = store
            .read_metadata_records("g")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_tear_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(OutputStore::new(dir.path()));
        let mut handles = Vec::new();
        for n in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append_metadata_record("g", &record(&format!("id-{n}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let text = std::fs::read_to_string(store.metadata_log_path("g")).unwrap();
        assert_eq!(text.lines().count(), 50);
        assert_eq!(store.read_metadata_records("g").await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_read_metadata_records_skips_malformed_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = OutputStore::new(dir.path());
        store.append_metadata_record("g", &record("ok")).await.unwrap();
        let path = store.metadata_log_path("g");
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{not json\n");
        std::fs::write(&path, text).unwrap();

        let records = store.read_metadata_records("g").await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_document_uri_carries_storage_prefix() {
        let store = OutputStore::new("/tmp/data").with_uri_prefix(Some("gs://kb-docs/".into()));
        assert_eq!(store.document_uri("docs", "ENG 1.html"), "gs://kb-docs/docs/ENG 1.html");
        assert_eq!(store.object_name("docs", "ENG 1.html"), "docs/ENG 1.html");
        let record = MetadataRecord::new("1", "t", "u", "c", "text/html", store.document_uri("docs", "ENG 1.html"));
        assert_eq!(record.file_name(), "ENG 1.html");
    }

    #[test]
    fn test_document_uri_is_relative_to_data_dir() {
        let store = OutputStore::new("/tmp/data");
        assert_eq!(store.document_uri("docs", "ENG 1.html"), "docs/ENG 1.html");
        assert_eq!(
            store.document_path("docs", "ENG 1.html"),
            PathBuf::from("/tmp/data/docs/ENG 1.html")
        );
    }
}
