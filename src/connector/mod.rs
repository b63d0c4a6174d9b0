//! Source connectors and target dispatch.
//!
//! A configured target is turned into a [`TargetSpec`], a tagged enum with
//! one variant per supported source/type pair. Dispatch is an exhaustive
//! `match`, so adding a variant without wiring its connector does not compile.
//! Unknown source/type pairs surface as [`ConnectorError::DispatchMiss`]
//! before any work starts.
//!
//! | source   | type           | items        |
//! |----------|----------------|--------------|
//! | `wiki`   | `all`          | -            |
//! | `wiki`   | `spaces`       | space keys   |
//! | `wiki`   | `pages`        | page ids     |
//! | `issues` | `jql`          | queries      |
//! | `issues` | `epic-summary` | project keys |
//! | `web`    | `url`          | seed URLs    |

pub mod filter;
pub mod issues;
pub mod web;
pub mod wiki;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::instrument;

use crate::config::{
    Config, ConfigError, IssueSourceConfig, TargetConfig, TestStepSourceConfig, WikiSourceConfig,
};
use crate::fetch::{FetchError, RetryPolicy};
use crate::output::{OutputError, OutputStore};

pub use filter::{AttachmentFilter, Rejection};
pub use issues::{IssueConnector, JqlOptions};
pub use web::{VisitedSet, WebCrawlSession, WebOptions};
pub use wiki::{WikiConnector, WikiOptions, WikiPageOptions};

/// Errors raised by connectors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// A fetch failed after retries, or returned an unusable body.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Writing an artifact or metadata record failed.
    #[error(transparent)]
    Output(#[from] OutputError),

    /// No connector handles this source/type pair.
    #[error("no connector for source '{source_name}' with type '{kind}'")]
    DispatchMiss {
        /// Configured source name.
        source_name: String,
        /// Configured target type.
        kind: String,
    },

    /// A user-supplied pattern is not a valid regex.
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// The regex compile error.
        #[source]
        source: regex::Error,
    },

    /// The options table does not decode for this target type.
    #[error("invalid options for {source_name}/{kind}: {source}")]
    InvalidOptions {
        /// Configured source name.
        source_name: String,
        /// Configured target type.
        kind: String,
        /// The decode error.
        #[source]
        source: toml::de::Error,
    },

    /// The target needs a source section that is not configured.
    #[error("target needs a [{section}] section in the configuration")]
    MissingSource {
        /// Name of the missing section.
        section: &'static str,
    },

    /// Credentials could not be resolved.
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] ConfigError),
}

/// Connection settings shared by all targets of a run.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    pub wiki: Option<WikiSourceConfig>,
    pub issues: Option<IssueSourceConfig>,
    pub test_steps: Option<TestStepSourceConfig>,
}

impl Sources {
    /// Copies the source sections out of a loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            wiki: config.wiki.clone(),
            issues: config.issues.clone(),
            test_steps: config.test_steps.clone(),
        }
    }
}

/// Everything a connector needs to run one target.
#[derive(Debug, Clone)]
pub struct CrawlContext {
    /// Group the target belongs to; artifacts land in this group's output.
    pub group: String,
    pub output: Arc<OutputStore>,
    pub retry: RetryPolicy,
    pub sources: Arc<Sources>,
}

/// What one connector run produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Artifacts written with a metadata record.
    pub emitted: usize,
    /// Items skipped by filters (banned, unsupported type, banned title).
    pub skipped: usize,
    /// Items that failed individually without failing the target.
    pub failed: usize,
}

impl CrawlReport {
    /// Adds another report's counters to this one.
    pub fn absorb(&mut self, other: CrawlReport) {
        self.emitted += other.emitted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Per-item failures of a multi-item target.
///
/// A failed item is counted in the report and the target moves on to the
/// next one. The target itself fails only when it had items and every one
/// of them failed; the first error is returned in that case.
#[derive(Debug, Default)]
pub(crate) struct ItemTally {
    attempted: usize,
    failed: usize,
    first_error: Option<ConnectorError>,
}

impl ItemTally {
    pub(crate) fn succeeded(&mut self) {
        self.attempted += 1;
    }

    pub(crate) fn failed(&mut self, report: &mut CrawlReport, error: ConnectorError) {
        self.attempted += 1;
        self.failed += 1;
        report.failed += 1;
        self.first_error.get_or_insert(error);
    }

    pub(crate) fn finish(self, report: CrawlReport) -> Result<CrawlReport, ConnectorError> {
        match self.first_error {
            Some(error) if self.failed == self.attempted => Err(error),
            _ => Ok(report),
        }
    }
}

/// A target resolved to the connector that will run it.
#[derive(Debug, Clone)]
pub enum TargetSpec {
    /// Every page of every global space.
    WikiAll { options: WikiOptions },
    /// Every page of the listed spaces.
    WikiSpaces {
        space_keys: Vec<String>,
        options: WikiOptions,
    },
    /// Explicit pages, optionally with their descendants.
    WikiPages {
        page_ids: Vec<String>,
        options: WikiPageOptions,
    },
    /// Issues matching tracker queries.
    IssueJql {
        queries: Vec<String>,
        options: JqlOptions,
    },
    /// One summary document per epic of each project.
    IssueEpicSummary { projects: Vec<String> },
    /// Recursive crawl from seed URLs.
    WebUrl {
        seeds: Vec<String>,
        options: WebOptions,
    },
}

impl TargetSpec {
    /// Resolves a configured target.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::DispatchMiss`] for an unknown source/type pair and
    /// [`ConnectorError::InvalidOptions`] when a known option has the wrong type.
    pub fn from_config(target: &TargetConfig) -> Result<Self, ConnectorError> {
        let source = target.source.as_str();
        let kind = target.settings.kind.as_str();
        let items = target.settings.items.clone();
        let options = &target.settings.options;

        let spec = match (source, kind) {
            ("wiki", "all") => Self::WikiAll {
                options: decode_options(source, kind, options)?,
            },
            ("wiki", "spaces") => Self::WikiSpaces {
                space_keys: items,
                options: decode_options(source, kind, options)?,
            },
            ("wiki", "pages") => Self::WikiPages {
                page_ids: items,
                options: decode_options(source, kind, options)?,
            },
            ("issues", "jql") => Self::IssueJql {
                queries: items,
                options: decode_options(source, kind, options)?,
            },
            ("issues", "epic-summary") => Self::IssueEpicSummary { projects: items },
            ("web", "url") => Self::WebUrl {
                seeds: items,
                options: decode_options(source, kind, options)?,
            },
            _ => {
                return Err(ConnectorError::DispatchMiss {
                    source_name: target.source.clone(),
                    kind: target.settings.kind.clone(),
                });
            }
        };
        Ok(spec)
    }

    /// Short `source/type` label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::WikiAll { .. } => "wiki/all",
            Self::WikiSpaces { .. } => "wiki/spaces",
            Self::WikiPages { .. } => "wiki/pages",
            Self::IssueJql { .. } => "issues/jql",
            Self::IssueEpicSummary { .. } => "issues/epic-summary",
            Self::WebUrl { .. } => "web/url",
        }
    }

    /// Runs the matching connector.
    ///
    /// # Errors
    ///
    /// Any [`ConnectorError`] the connector could not recover from.
    #[instrument(skip(self, ctx), fields(group = %ctx.group, target = self.label()))]
    pub async fn crawl(&self, ctx: &CrawlContext) -> Result<CrawlReport, ConnectorError> {
        match self {
            Self::WikiAll { options } => WikiConnector::from_context(ctx)?.crawl_all(options).await,
            Self::WikiSpaces {
                space_keys,
                options,
            } => {
                WikiConnector::from_context(ctx)?
                    .crawl_spaces(space_keys, options)
                    .await
            }
            Self::WikiPages { page_ids, options } => {
                WikiConnector::from_context(ctx)?
                    .crawl_pages(page_ids, options)
                    .await
            }
            Self::IssueJql { queries, options } => {
                IssueConnector::from_context(ctx)?
                    .crawl_jql(queries, options)
                    .await
            }
            Self::IssueEpicSummary { projects } => {
                IssueConnector::from_context(ctx)?
                    .crawl_epic_summaries(projects)
                    .await
            }
            Self::WebUrl { seeds, options } => web::crawl_seeds(ctx, seeds, options).await,
        }
    }
}

fn decode_options<T: DeserializeOwned>(
    source: &str,
    kind: &str,
    options: &toml::Table,
) -> Result<T, ConnectorError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|source_err| ConnectorError::InvalidOptions {
            source_name: source.to_string(),
            kind: kind.to_string(),
            source: source_err,
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::TargetSettings;

    fn target(source: &str, kind: &str, options: &str) -> TargetConfig {
        TargetConfig {
            source: source.to_string(),
            settings: TargetSettings {
                kind: kind.to_string(),
                items: vec!["X".to_string()],
                options: toml::from_str(options).unwrap(),
            },
        }
    }

    #[test]
    fn test_every_known_pair_resolves() {
        for (source, kind, label) in [
            ("wiki", "all", "wiki/all"),
            ("wiki", "spaces", "wiki/spaces"),
            ("wiki", "pages", "wiki/pages"),
            ("issues", "jql", "issues/jql"),
            ("issues", "epic-summary", "issues/epic-summary"),
            ("web", "url", "web/url"),
        ] {
            let spec = TargetSpec::from_config(&target(source, kind, "")).unwrap();
            assert_eq!(spec.label(), label);
        }
    }

    #[test]
    fn test_unknown_pair_is_dispatch_miss() {
        let err = TargetSpec::from_config(&target("wiki", "blogposts", "")).unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::DispatchMiss { ref source_name, ref kind }
                if source_name == "wiki" && kind == "blogposts"
        ));
        let err = TargetSpec::from_config(&target("ftp", "url", "")).unwrap_err();
        assert!(matches!(err, ConnectorError::DispatchMiss { .. }));
    }

    #[test]
    fn test_unknown_options_are_ignored() {
        let spec = TargetSpec::from_config(&target(
            "web",
            "url",
            "include_links = true\ndepth = 3\nshiny = \"yes\"",
        ))
        .unwrap();
        match spec {
            TargetSpec::WebUrl { options, .. } => {
                assert!(options.include_links);
                assert_eq!(options.depth, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_mistyped_option_is_invalid_options() {
        let err = TargetSpec::from_config(&target("web", "url", "depth = \"deep\"")).unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidOptions { .. }));
    }

    fn missing(section: &'static str) -> ConnectorError {
        ConnectorError::MissingSource { section }
    }

    #[test]
    fn test_item_tally_partial_failure_keeps_report() {
        let mut report = CrawlReport::default();
        let mut tally = ItemTally::default();
        tally.failed(&mut report, missing("wiki"));
        tally.succeeded();
        report.emitted += 1;
        let report = tally.finish(report).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.emitted, 1);
    }

    #[test]
    fn test_item_tally_all_failed_returns_first_error() {
        let mut report = CrawlReport::default();
        let mut tally = ItemTally::default();
        tally.failed(&mut report, missing("first"));
        tally.failed(&mut report, missing("second"));
        let err = tally.finish(report).unwrap_err();
        assert!(matches!(err, ConnectorError::MissingSource { section: "first" }));
    }

    #[test]
    fn test_item_tally_no_items_is_ok() {
        let report = ItemTally::default().finish(CrawlReport::default()).unwrap();
        assert_eq!(report, CrawlReport::default());
    }

    #[test]
    fn test_crawl_report_absorb() {
        let mut total = CrawlReport::default();
        total.absorb(CrawlReport {
            emitted: 2,
            skipped: 1,
            failed: 0,
        });
        total.absorb(CrawlReport {
            emitted: 1,
            skipped: 0,
            failed: 3,
        });
        assert_eq!(
            total,
            CrawlReport {
                emitted: 3,
                skipped: 1,
                failed: 3
            }
        );
    }
}
