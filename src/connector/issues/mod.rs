//! Issue tracker connectors: query results and per-epic story summaries.
//!
//! Every issue becomes `issues <KEY>.html`, a plain-text body built by
//! [`format`]. Test steps come from a separate test-management API and are
//! only fetched when a query asks for them.

mod api;
mod format;
mod test_steps;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

pub use api::{Comment, Issue, IssueApi, SEARCH_PAGE_SIZE};
pub use format::{comments_section, epic_summary, issue_body, issue_fields, test_steps_section};
pub use test_steps::{
    Claims, SigningError, SigningKeys, TOKEN_TTL_SECS, TestStep, TestStepApi, canonical_request,
    query_string_hash, sign_token,
};

use super::{ConnectorError, CrawlContext, CrawlReport, ItemTally};
use crate::fetch::{ApiClient, Auth};
use crate::output::{MetadataRecord, build_filename};
use crate::user_agent::default_api_user_agent;

/// Options for `issues/jql`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JqlOptions {
    pub include_comments: bool,
    pub include_test_steps: bool,
}

/// One issue target run.
pub struct IssueConnector<'a> {
    api: IssueApi,
    test_steps: Option<TestStepApi>,
    ctx: &'a CrawlContext,
}

impl<'a> IssueConnector<'a> {
    /// Builds a connector from the context's `[issues]` and, when present,
    /// `[test_steps]` sections.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::MissingSource`] when no tracker is configured and
    /// [`ConnectorError::Credentials`] when credentials cannot be resolved.
    pub fn from_context(ctx: &'a CrawlContext) -> Result<Self, ConnectorError> {
        let source = ctx
            .sources
            .issues
            .as_ref()
            .ok_or(ConnectorError::MissingSource { section: "issues" })?;
        let auth = Auth::Basic {
            user: source.user.resolve()?,
            token: source.token.resolve()?,
        };
        let client = ApiClient::new(&source.base_url, auth)?;
        let api = IssueApi::new(client, ctx.retry, source.custom_fields.clone());

        let test_steps = match &ctx.sources.test_steps {
            Some(ts) => {
                let keys = SigningKeys {
                    account_id: ts.account_id.resolve()?,
                    access_key: ts.access_key.resolve()?,
                    secret_key: ts.secret_key.resolve()?,
                };
                let client = ApiClient::unbound(&default_api_user_agent())?;
                Some(TestStepApi::new(client, ctx.retry, &ts.base_url, keys))
            }
            None => None,
        };

        Ok(Self {
            api,
            test_steps,
            ctx,
        })
    }

    /// Crawls every issue matching each query in turn.
    ///
    /// # Errors
    ///
    /// Fails when test steps are requested without a `[test_steps]` section,
    /// or when every query failed. A failed query, or a failure to fetch one
    /// issue's comments or steps, is counted in the report instead.
    #[instrument(skip_all, fields(group = %self.ctx.group, queries = queries.len()))]
    pub async fn crawl_jql(
        &self,
        queries: &[String],
        options: &JqlOptions,
    ) -> Result<CrawlReport, ConnectorError> {
        if options.include_test_steps && self.test_steps.is_none() {
            return Err(ConnectorError::MissingSource {
                section: "test_steps",
            });
        }

        let mut report = CrawlReport::default();
        let mut tally = ItemTally::default();
        for jql in queries {
            let issues = match self.api.search(jql).await {
                Ok(issues) => issues,
                Err(e) => {
                    warn!(jql = %jql, error = %e, "query failed");
                    tally.failed(&mut report, e.into());
                    continue;
                }
            };
            tally.succeeded();
            info!(jql = %jql, issues = issues.len(), "query returned issues");
            for issue in &issues {
                match self.emit_issue(issue, options).await {
                    Ok(()) => report.emitted += 1,
                    Err(e) => {
                        warn!(key = %issue.key, error = %e, "failed to emit issue");
                        report.failed += 1;
                    }
                }
            }
        }
        tally.finish(report)
    }

    /// Emits one summary document per epic that has at least one story.
    ///
    /// # Errors
    ///
    /// Fails when the epics of every project could not be listed. One
    /// project's listing failure is counted and the next project is crawled.
    #[instrument(skip_all, fields(group = %self.ctx.group, projects = projects.len()))]
    pub async fn crawl_epic_summaries(
        &self,
        projects: &[String],
    ) -> Result<CrawlReport, ConnectorError> {
        let mut report = CrawlReport::default();
        let mut tally = ItemTally::default();
        for project in projects {
            let epics = match self.api.epics(project).await {
                Ok(epics) => epics,
                Err(e) => {
                    warn!(project = %project, error = %e, "failed to list epics");
                    tally.failed(&mut report, e.into());
                    continue;
                }
            };
            tally.succeeded();
            info!(project = %project, epics = epics.len(), "found epics");

            for epic in &epics {
                let stories = match self.api.children_of(&epic.key).await {
                    Ok(stories) => stories,
                    Err(e) => {
                        warn!(epic = %epic.key, error = %e, "failed to list stories");
                        report.failed += 1;
                        continue;
                    }
                };
                if stories.is_empty() {
                    debug!(epic = %epic.key, "no stories, skipping");
                    report.skipped += 1;
                    continue;
                }
                let body = epic_summary(epic, &stories);
                let title = format!("[{}] Epic: {}", epic.key, epic.summary);
                match self.save(epic, &title, &body).await {
                    Ok(()) => report.emitted += 1,
                    Err(e) => {
                        warn!(epic = %epic.key, error = %e, "failed to save epic summary");
                        report.failed += 1;
                    }
                }
            }
        }
        tally.finish(report)
    }

    async fn emit_issue(&self, issue: &Issue, options: &JqlOptions) -> Result<(), ConnectorError> {
        let steps = match (&self.test_steps, options.include_test_steps) {
            (Some(api), true) => api.steps(&issue.id, &issue.project_id).await?,
            _ => Vec::new(),
        };
        let comments = if options.include_comments {
            self.api.comments(&issue.key).await?
        } else {
            Vec::new()
        };

        let body = issue_body(issue, &steps, &comments);
        let title = format!("[{}] {}", issue.key, issue.summary);
        self.save(issue, &title, &body).await
    }

    async fn save(&self, issue: &Issue, title: &str, body: &str) -> Result<(), ConnectorError> {
        let output = &self.ctx.output;
        let group = &self.ctx.group;
        let file_name = build_filename(&format!("issues {}", issue.key), "html");
        let path = output.prepare_document_path(group, &file_name).await?;
        output.save_document(&path, body.as_bytes()).await?;

        let record = MetadataRecord::new(
            &issue.key,
            title,
            self.api.browse_url(&issue.key),
            &issue.created,
            "text/html",
            output.document_uri(group, &file_name),
        )
        .with_extra("updatedAt", issue.updated.as_str());
        output.append_metadata_record(group, &record).await?;
        Ok(())
    }
}
