//! Harvester Core Library
//!
//! Crawls a wiki, an issue tracker and arbitrary web pages into per-group
//! folders of documents with an NDJSON metadata log, then hands each group
//! to an upload destination.
//!
//! # Architecture
//!
//! - [`config`] - TOML configuration, groups and targets
//! - [`fetch`] - HTTP client, retry, rate limiting and pagination
//! - [`connector`] - wiki, issue and web connectors plus target dispatch
//! - [`output`] - artifact files and the metadata log
//! - [`snapshot`] - relational copy of a group's metadata log
//! - [`upload`] - local, remote dataset and object storage destinations
//! - [`orchestrator`] - runs groups and targets concurrently

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connector;
pub mod fetch;
pub mod orchestrator;
pub mod output;
pub mod snapshot;
pub mod upload;
mod user_agent;

// Re-export commonly used types
pub use config::{Config, ConfigError, GroupConfig, TargetConfig, UploadDestination};
pub use connector::{ConnectorError, CrawlContext, CrawlReport, Sources, TargetSpec};
pub use fetch::{
    ApiClient, Auth, DEFAULT_MAX_RETRIES, FetchError, RateLimiter, RetryPolicy,
};
pub use orchestrator::{
    GroupSummary, Orchestrator, RunSummary, TargetOutcome, TargetResult, UploadOutcome,
};
pub use output::{MetadataRecord, OutputError, OutputStore};
pub use upload::{
    DatasetUploader, LocalUploader, ObjectStorageUploader, UploadError, UploadSummary, Uploader,
};
