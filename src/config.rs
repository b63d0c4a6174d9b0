//! Static run configuration loaded from TOML.
//!
//! ```toml
//! data_dir = "data"
//!
//! [wiki]
//! base_url = "https://acme.atlassian.net"
//! user = { env = "WIKI_USER" }
//! token = { env = "WIKI_TOKEN" }
//!
//! [groups.engineering]
//! upload_destination = "local"
//!
//! [[groups.engineering.targets]]
//! source = "wiki"
//! settings = { type = "pages", items = ["12345"], options = { include_child_pages = true } }
//! ```
//!
//! Groups with `upload_destination = "object_storage"` replace their folder
//! in the `[object_storage]` bucket, and metadata records then carry
//! `gs://<bucket>/<group>/<file>` URIs.
//!
//! Credentials are either literal strings or `{ env = "VAR" }` references
//! resolved when a connector is built, so a missing variable only fails the
//! targets that need it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::fetch::RetryPolicy;

/// Default output directory.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default pause between wiki items (250ms).
pub const DEFAULT_WIKI_ITEM_DELAY_MS: u64 = 250;

/// Default dataset upload rate (requests per minute).
pub const DEFAULT_DATASET_RATE_PER_MINUTE: u32 = 60;

/// Default pause between purging a dataset and uploading into it (5s).
pub const DEFAULT_DATASET_SETTLE_DELAY_MS: u64 = 5000;

/// Default object storage JSON API root.
pub const DEFAULT_OBJECT_STORAGE_BASE_URL: &str = "https://storage.googleapis.com";

/// Default search index API root.
pub const DEFAULT_SEARCH_INDEX_BASE_URL: &str = "https://discoveryengine.googleapis.com/v1beta";

/// Default test-management API base URL.
pub const DEFAULT_TEST_STEPS_BASE_URL: &str = "https://prod-api.zephyr4jiracloud.com/connect";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// A credential references an unset environment variable.
    #[error("environment variable {var} is not set")]
    MissingSecret {
        /// Name of the variable.
        var: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for group outputs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Retry settings applied to every fetch.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Wiki source.
    pub wiki: Option<WikiSourceConfig>,

    /// Issue tracker source.
    pub issues: Option<IssueSourceConfig>,

    /// Test-management source used by issue queries with test steps.
    pub test_steps: Option<TestStepSourceConfig>,

    /// Remote dataset used by the `dataset` upload destination.
    pub dataset: Option<DatasetConfig>,

    /// Bucket used by the `object_storage` upload destination.
    pub object_storage: Option<ObjectStorageConfig>,

    /// Prefix of every `content.uri` in metadata records, e.g. `gs://kb-docs`.
    /// Defaults to `gs://<bucket>` when `[object_storage]` is configured.
    pub storage_uri_prefix: Option<String>,

    /// Target groups keyed by name.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

/// Retry knobs.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries(),
            initial_delay_ms: u64::try_from(policy.initial_delay().as_millis()).unwrap_or(500),
        }
    }
}

impl RetryConfig {
    /// Builds the matching [`RetryPolicy`].
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.initial_delay_ms))
    }
}

/// A credential: a literal string or `{ env = "VAR" }`.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretRef {
    /// Read from an environment variable when needed.
    Env {
        /// Variable name.
        env: String,
    },
    /// Inline value.
    Literal(String),
}

impl std::fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env { env } => write!(f, "Env({env})"),
            Self::Literal(_) => write!(f, "Literal(<redacted>)"),
        }
    }
}

impl SecretRef {
    /// Returns the secret value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] when the referenced variable is unset or empty.
    pub fn resolve(&self) -> Result<String, ConfigError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Env { env } => std::env::var(env)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingSecret { var: env.clone() }),
        }
    }
}

/// Wiki connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WikiSourceConfig {
    pub base_url: String,
    pub user: SecretRef,
    pub token: SecretRef,
    /// Pause between emitted items, in milliseconds.
    #[serde(default = "default_wiki_item_delay_ms")]
    pub item_delay_ms: u64,
}

fn default_wiki_item_delay_ms() -> u64 {
    DEFAULT_WIKI_ITEM_DELAY_MS
}

/// Issue tracker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueSourceConfig {
    pub base_url: String,
    pub user: SecretRef,
    pub token: SecretRef,
    /// Custom fields rendered into issue bodies, in order.
    #[serde(default)]
    pub custom_fields: Vec<CustomField>,
}

/// A custom issue field shown under a display name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CustomField {
    /// Label used in the document body.
    pub name: String,
    /// Field id in the tracker, e.g. `customfield_10014`.
    pub field: String,
}

/// Test-management API credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct TestStepSourceConfig {
    #[serde(default = "default_test_steps_base_url")]
    pub base_url: String,
    pub account_id: SecretRef,
    pub access_key: SecretRef,
    pub secret_key: SecretRef,
}

fn default_test_steps_base_url() -> String {
    DEFAULT_TEST_STEPS_BASE_URL.to_string()
}

/// Remote dataset settings for the `dataset` upload destination.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub base_url: String,
    pub api_key: SecretRef,
    /// Dataset used by groups that do not name their own.
    pub dataset_id: Option<String>,
    #[serde(default = "default_dataset_rate")]
    pub rate_per_minute: u32,
    /// Pause after purging before uploading, in milliseconds.
    #[serde(default = "default_dataset_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_dataset_rate() -> u32 {
    DEFAULT_DATASET_RATE_PER_MINUTE
}

fn default_dataset_settle_delay_ms() -> u64 {
    DEFAULT_DATASET_SETTLE_DELAY_MS
}

/// Bucket settings for the `object_storage` upload destination.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStorageConfig {
    /// JSON API root of the storage service.
    #[serde(default = "default_object_storage_base_url")]
    pub base_url: String,
    pub bucket: String,
    /// OAuth access token sent as a bearer token to storage and index.
    pub token: SecretRef,
    /// Search index re-imported after each group upload.
    pub search_index: Option<SearchIndexConfig>,
}

fn default_object_storage_base_url() -> String {
    DEFAULT_OBJECT_STORAGE_BASE_URL.to_string()
}

/// Search data stores fed from the bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchIndexConfig {
    #[serde(default = "default_search_index_base_url")]
    pub base_url: String,
    pub project_id: String,
    #[serde(default = "default_search_index_location")]
    pub location: String,
    /// Data store id per group. Groups without an entry are not re-indexed.
    #[serde(default)]
    pub data_stores: BTreeMap<String, String>,
}

fn default_search_index_base_url() -> String {
    DEFAULT_SEARCH_INDEX_BASE_URL.to_string()
}

fn default_search_index_location() -> String {
    "global".to_string()
}

/// Where a group's output goes once all its targets settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadDestination {
    /// Snapshot, purge and re-upload into the configured remote dataset.
    Dataset,
    /// Replace the group's folder in a bucket, then refresh its search index.
    ObjectStorage,
    /// Keep the files on disk only.
    Local,
}

/// One named group of targets.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub upload_destination: UploadDestination,
    /// Remote dataset for this group, overriding `[dataset].dataset_id`.
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// One target as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Source name: `wiki`, `issues` or `web`.
    pub source: String,
    pub settings: TargetSettings,
}

/// Source-specific settings bag.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSettings {
    /// Target type within the source, e.g. `pages` or `jql`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Item identifiers: space keys, page ids, queries, project keys or URLs.
    #[serde(default)]
    pub items: Vec<String>,
    /// Free-form options; unknown keys are ignored.
    #[serde(default)]
    pub options: toml::Table,
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, group) in &self.groups {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("group names must not be empty".into()));
            }
            if group.upload_destination == UploadDestination::Dataset {
                let Some(dataset) = &self.dataset else {
                    return Err(ConfigError::Invalid(format!(
                        "group '{name}' uploads to a dataset but no [dataset] section is configured"
                    )));
                };
                if group.dataset_id.is_none() && dataset.dataset_id.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "group '{name}' uploads to a dataset but no dataset_id is set"
                    )));
                }
            }
            if group.upload_destination == UploadDestination::ObjectStorage
                && self.object_storage.is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "group '{name}' uploads to object storage but no [object_storage] section is configured"
                )));
            }
        }
        if let Some(storage) = &self.object_storage {
            if storage.bucket.trim().is_empty() {
                return Err(ConfigError::Invalid("object_storage.bucket must not be empty".into()));
            }
        }
        if let Some(dataset) = &self.dataset {
            if dataset.rate_per_minute == 0 {
                return Err(ConfigError::Invalid(
                    "dataset.rate_per_minute must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    /// Prefix for `content.uri` in metadata records, if records should carry
    /// a storage URI rather than a path relative to `data_dir`.
    #[must_use]
    pub fn storage_uri_prefix(&self) -> Option<String> {
        self.storage_uri_prefix.clone().or_else(|| {
            self.object_storage
                .as_ref()
                .map(|storage| format!("gs://{}", storage.bucket))
        })
    }

    /// Dataset ids of every group uploading to a dataset, keyed by group name.
    #[must_use]
    pub fn dataset_ids(&self) -> BTreeMap<String, String> {
        let default = self.dataset.as_ref().and_then(|d| d.dataset_id.clone());
        self.groups
            .iter()
            .filter(|(_, g)| g.upload_destination == UploadDestination::Dataset)
            .filter_map(|(name, g)| {
                g.dataset_id
                    .clone()
                    .or_else(|| default.clone())
                    .map(|id| (name.clone(), id))
            })
            .collect()
    }

    /// Keeps only the named groups. An empty filter keeps everything.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a requested group does not exist.
    pub fn retain_groups(&mut self, names: &[String]) -> Result<(), ConfigError> {
        if names.is_empty() {
            return Ok(());
        }
        if let Some(missing) = names.iter().find(|n| !self.groups.contains_key(*n)) {
            return Err(ConfigError::Invalid(format!("unknown group '{missing}'")));
        }
        self.groups.retain(|name, _| names.contains(name));
        Ok(())
    }
}
