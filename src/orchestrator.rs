//! Group and target fan-out.
//!
//! Every group runs as its own task; inside a group every target runs as its
//! own task. A group's upload starts only after all of its target tasks have
//! been joined, failed ones included, and runs exactly once. Target failures
//! never cancel siblings: they are logged and reported in the [`RunSummary`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::config::{Config, GroupConfig, UploadDestination};
use crate::connector::{ConnectorError, CrawlContext, CrawlReport, Sources, TargetSpec};
use crate::fetch::RetryPolicy;
use crate::output::OutputStore;
use crate::upload::{
    DatasetUploader, LocalUploader, ObjectStorageUploader, UploadError, UploadSummary, Uploader,
};

/// How one target ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// The connector finished; individual items may still have failed.
    Succeeded(CrawlReport),
    /// The connector stopped with an error.
    Failed(String),
    /// No connector handles the target's source/type pair.
    DispatchMiss,
}

/// One target's result within its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetResult {
    /// Position of the target in the group's configuration.
    pub index: usize,
    /// `source/type` as configured.
    pub label: String,
    pub outcome: TargetOutcome,
}

/// How a group's upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed(UploadSummary),
    Failed(String),
}

/// Everything one group did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub name: String,
    pub targets: Vec<TargetResult>,
    pub upload: UploadOutcome,
}

/// Result of a whole run, in group name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub groups: Vec<GroupSummary>,
}

impl RunSummary {
    /// Targets that stopped with an error.
    #[must_use]
    pub fn failed_targets(&self) -> usize {
        self.targets()
            .filter(|t| matches!(t.outcome, TargetOutcome::Failed(_)))
            .count()
    }

    /// Targets no connector could handle.
    #[must_use]
    pub fn dispatch_misses(&self) -> usize {
        self.targets()
            .filter(|t| t.outcome == TargetOutcome::DispatchMiss)
            .count()
    }

    /// Groups whose upload failed.
    #[must_use]
    pub fn failed_uploads(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| matches!(g.upload, UploadOutcome::Failed(_)))
            .count()
    }

    /// Whether any target or upload failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed_targets() > 0 || self.failed_uploads() > 0
    }

    /// Sum of every successful target's report.
    #[must_use]
    pub fn crawled(&self) -> CrawlReport {
        let mut total = CrawlReport::default();
        for target in self.targets() {
            if let TargetOutcome::Succeeded(report) = target.outcome {
                total.absorb(report);
            }
        }
        total
    }

    fn targets(&self) -> impl Iterator<Item = &TargetResult> {
        self.groups.iter().flat_map(|g| g.targets.iter())
    }
}

/// Runs every configured group.
pub struct Orchestrator {
    groups: BTreeMap<String, GroupConfig>,
    output: Arc<OutputStore>,
    sources: Arc<Sources>,
    retry: RetryPolicy,
    uploaders: HashMap<UploadDestination, Arc<dyn Uploader>>,
}

impl Orchestrator {
    /// Creates an orchestrator writing to `output` with only the local uploader registered.
    #[must_use]
    pub fn new(config: &Config, output: Arc<OutputStore>) -> Self {
        let mut uploaders: HashMap<UploadDestination, Arc<dyn Uploader>> = HashMap::new();
        uploaders.insert(
            UploadDestination::Local,
            Arc::new(LocalUploader::new(Arc::clone(&output))),
        );
        Self {
            groups: config.groups.clone(),
            output,
            sources: Arc::new(Sources::from_config(config)),
            retry: config.retry.policy(),
            uploaders,
        }
    }

    /// Creates an orchestrator with the uploaders the configuration asks for.
    ///
    /// Metadata records carry the configured storage URI prefix.
    ///
    /// # Errors
    ///
    /// [`UploadError`] when the dataset or object storage uploader cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, UploadError> {
        let output = Arc::new(
            OutputStore::new(config.data_dir.clone()).with_uri_prefix(config.storage_uri_prefix()),
        );
        let mut orchestrator = Self::new(config, Arc::clone(&output));
        if let Some(dataset) = &config.dataset {
            let ids = config.dataset_ids();
            if !ids.is_empty() {
                let uploader =
                    DatasetUploader::new(dataset, ids, Arc::clone(&output), orchestrator.retry)?;
                orchestrator = orchestrator.with_uploader(UploadDestination::Dataset, Arc::new(uploader));
            }
        }
        if let Some(storage) = &config.object_storage {
            let used = config
                .groups
                .values()
                .any(|g| g.upload_destination == UploadDestination::ObjectStorage);
            if used {
                let uploader = ObjectStorageUploader::new(storage, output, orchestrator.retry)?;
                orchestrator =
                    orchestrator.with_uploader(UploadDestination::ObjectStorage, Arc::new(uploader));
            }
        }
        Ok(orchestrator)
    }

    /// Registers the uploader used for `destination`.
    #[must_use]
    pub fn with_uploader(mut self, destination: UploadDestination, uploader: Arc<dyn Uploader>) -> Self {
        self.uploaders.insert(destination, uploader);
        self
    }

    /// Overrides the retry policy given to every connector.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn output(&self) -> &Arc<OutputStore> {
        &self.output
    }

    /// Runs all groups concurrently and waits for every one of them.
    #[instrument(skip(self), fields(groups = self.groups.len()))]
    pub async fn run(&self) -> RunSummary {
        let mut handles = Vec::new();
        for (name, group) in &self.groups {
            let task = GroupTask {
                name: name.clone(),
                group: group.clone(),
                output: Arc::clone(&self.output),
                sources: Arc::clone(&self.sources),
                retry: self.retry,
                uploader: self.uploaders.get(&group.upload_destination).cloned(),
            };
            handles.push((name.clone(), tokio::spawn(task.run())));
        }

        let mut summary = RunSummary::default();
        for (name, handle) in handles {
            match handle.await {
                Ok(group) => summary.groups.push(group),
                Err(e) => {
                    error!(group = %name, error = %e, "group task panicked");
                    summary.groups.push(GroupSummary {
                        name,
                        targets: Vec::new(),
                        upload: UploadOutcome::Failed(format!("group task panicked: {e}")),
                    });
                }
            }
        }

        info!(
            groups = summary.groups.len(),
            failed_targets = summary.failed_targets(),
            dispatch_misses = summary.dispatch_misses(),
            failed_uploads = summary.failed_uploads(),
            "run complete"
        );
        summary
    }
}

struct GroupTask {
    name: String,
    group: GroupConfig,
    output: Arc<OutputStore>,
    sources: Arc<Sources>,
    retry: RetryPolicy,
    uploader: Option<Arc<dyn Uploader>>,
}

impl GroupTask {
    async fn run(self) -> GroupSummary {
        info!(group = %self.name, targets = self.group.targets.len(), "starting group");
        if let Err(e) = self.output.clear_group_output(&self.name).await {
            error!(group = %self.name, error = %e, "failed to clear group output");
        }

        let ctx = CrawlContext {
            group: self.name.clone(),
            output: Arc::clone(&self.output),
            retry: self.retry,
            sources: Arc::clone(&self.sources),
        };

        let mut targets = Vec::with_capacity(self.group.targets.len());
        let mut handles = Vec::new();
        for (index, target) in self.group.targets.iter().enumerate() {
            let label = format!("{}/{}", target.source, target.settings.kind);
            match TargetSpec::from_config(target) {
                Ok(spec) => {
                    let ctx = ctx.clone();
                    handles.push((index, label, tokio::spawn(async move { spec.crawl(&ctx).await })));
                }
                Err(ConnectorError::DispatchMiss { .. }) => {
                    warn!(group = %self.name, index, target = %label, "no connector for target, skipping");
                    targets.push(TargetResult {
                        index,
                        label,
                        outcome: TargetOutcome::DispatchMiss,
                    });
                }
                Err(e) => {
                    error!(group = %self.name, index, target = %label, error = %e, "invalid target");
                    targets.push(TargetResult {
                        index,
                        label,
                        outcome: TargetOutcome::Failed(e.to_string()),
                    });
                }
            }
        }

        for (index, label, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(report)) => {
                    info!(
                        group = %self.name,
                        index,
                        target = %label,
                        emitted = report.emitted,
                        skipped = report.skipped,
                        failed = report.failed,
                        "target finished"
                    );
                    TargetOutcome::Succeeded(report)
                }
                Ok(Err(e)) => {
                    error!(group = %self.name, index, target = %label, error = %e, "target failed");
                    TargetOutcome::Failed(e.to_string())
                }
                Err(e) => {
                    error!(group = %self.name, index, target = %label, error = %e, "target task panicked");
                    TargetOutcome::Failed(format!("task panicked: {e}"))
                }
            };
            targets.push(TargetResult {
                index,
                label,
                outcome,
            });
        }
        targets.sort_by_key(|t| t.index);

        let upload = self.upload().await;
        GroupSummary {
            name: self.name,
            targets,
            upload,
        }
    }

    async fn upload(&self) -> UploadOutcome {
        let Some(uploader) = &self.uploader else {
            error!(group = %self.name, destination = ?self.group.upload_destination, "no uploader registered");
            return UploadOutcome::Failed(format!(
                "no uploader registered for {:?}",
                self.group.upload_destination
            ));
        };
        let result = match uploader.upload_group(&self.name).await {
            Ok(summary) => uploader
                .refresh_search_index(&self.name)
                .await
                .map(|()| summary),
            Err(e) => Err(e),
        };
        match result {
            Ok(summary) => UploadOutcome::Completed(summary),
            Err(e) => {
                error!(group = %self.name, error = %e, "upload failed");
                UploadOutcome::Failed(e.to_string())
            }
        }
    }
}
