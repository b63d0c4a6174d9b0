//! Metadata records written to each group's NDJSON log.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Descriptor of one emitted artifact, one line in `0metadata.ndjson`.
///
/// ```json
/// {"id":"...","structData":{"title":"...","webUrl":"...","createdAt":"...","spaceName":"..."},
///  "content":{"mimeType":"text/html","uri":"docs/ENG 42.html"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    /// Stable id of the source item.
    pub id: String,
    /// Display fields for the downstream index.
    pub struct_data: StructData,
    /// Where the artifact lives and how to read it.
    pub content: ContentDescriptor,
}

/// Display fields; connector-specific extras are flattened alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructData {
    pub title: String,
    pub web_url: String,
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// MIME type and storage location of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptor {
    pub mime_type: String,
    /// Path relative to the data directory, `<group>/<file name>`.
    pub uri: String,
}

impl MetadataRecord {
    /// Creates a record with no extra fields.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        web_url: impl Into<String>,
        created_at: impl Into<String>,
        mime_type: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            struct_data: StructData {
                title: title.into(),
                web_url: web_url.into(),
                created_at: created_at.into(),
                extra: Map::new(),
            },
            content: ContentDescriptor {
                mime_type: mime_type.into(),
                uri: uri.into(),
            },
        }
    }

    /// Adds a connector-specific display field.
    #[must_use]
    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.struct_data.extra.insert(key.to_string(), value.into());
        self
    }

    /// File name part of the content URI.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.content
            .uri
            .rsplit('/')
            .next()
            .unwrap_or(self.content.uri.as_str())
    }
}
