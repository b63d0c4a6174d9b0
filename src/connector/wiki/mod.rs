//! Wiki connectors: all spaces, selected spaces, or explicit page ids.
//!
//! Every page becomes `<space key> <page id>.html` holding the raw storage
//! markup. Attachments are only fetched when the page body references them
//! by file name (`ri:filename="..."`), and only if they pass the
//! [`AttachmentFilter`].

mod api;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

pub use api::{AttachmentDocument, PageDocument, Space, WikiApi};

use super::filter::AttachmentFilter;
use super::{ConnectorError, CrawlContext, CrawlReport, ItemTally};
use crate::fetch::{ApiClient, Auth};
use crate::output::{MetadataRecord, build_filename, extension_of};

/// Captures the file name of an `ri:attachment` reference in storage markup.
#[allow(clippy::expect_used)]
static ATTACHMENT_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"ri:filename="([^"]+)""#).expect("attachment reference regex is valid")
});

/// Options for `wiki/all` and `wiki/spaces`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WikiOptions {
    pub banned_attachment_patterns: Vec<String>,
    pub include_attachments: bool,
}

impl Default for WikiOptions {
    fn default() -> Self {
        Self {
            banned_attachment_patterns: Vec::new(),
            include_attachments: true,
        }
    }
}

/// Options for `wiki/pages`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WikiPageOptions {
    pub include_child_pages: bool,
    pub exclude_pages: Vec<String>,
    pub banned_attachment_patterns: Vec<String>,
    pub include_attachments: bool,
}

impl Default for WikiPageOptions {
    fn default() -> Self {
        Self {
            include_child_pages: false,
            exclude_pages: Vec::new(),
            banned_attachment_patterns: Vec::new(),
            include_attachments: true,
        }
    }
}

/// File names referenced from a page's storage markup, in order of appearance.
#[must_use]
pub fn referenced_attachments(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    ATTACHMENT_REFERENCE
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// One wiki target run. Holds the per-run space cache.
pub struct WikiConnector<'a> {
    api: WikiApi,
    ctx: &'a CrawlContext,
    item_delay: Duration,
    spaces: HashMap<String, Space>,
}

impl<'a> WikiConnector<'a> {
    /// Builds a connector from the context's `[wiki]` section.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::MissingSource`] when no wiki is configured and
    /// [`ConnectorError::Credentials`] when credentials cannot be resolved.
    pub fn from_context(ctx: &'a CrawlContext) -> Result<Self, ConnectorError> {
        let source = ctx
            .sources
            .wiki
            .as_ref()
            .ok_or(ConnectorError::MissingSource { section: "wiki" })?;
        let auth = Auth::Basic {
            user: source.user.resolve()?,
            token: source.token.resolve()?,
        };
        let client = ApiClient::new(&source.base_url, auth)?;
        Ok(Self {
            api: WikiApi::new(client, ctx.retry),
            ctx,
            item_delay: Duration::from_millis(source.item_delay_ms),
            spaces: HashMap::new(),
        })
    }

    /// Crawls every page of every global space.
    ///
    /// # Errors
    ///
    /// Fails when the space listing cannot be fetched, or when the page
    /// listing of every space failed.
    #[instrument(skip_all, fields(group = %self.ctx.group))]
    pub async fn crawl_all(&mut self, options: &WikiOptions) -> Result<CrawlReport, ConnectorError> {
        let filter = AttachmentFilter::new(&options.banned_attachment_patterns)?;
        let spaces = self.api.list_spaces().await?;
        info!(spaces = spaces.len(), "found spaces");
        self.crawl_space_list(spaces, &filter, options.include_attachments)
            .await
    }

    /// Crawls every page of the spaces whose keys are listed.
    ///
    /// # Errors
    ///
    /// See [`crawl_all`](Self::crawl_all).
    #[instrument(skip_all, fields(group = %self.ctx.group, spaces = space_keys.len()))]
    pub async fn crawl_spaces(
        &mut self,
        space_keys: &[String],
        options: &WikiOptions,
    ) -> Result<CrawlReport, ConnectorError> {
        let filter = AttachmentFilter::new(&options.banned_attachment_patterns)?;
        let wanted: HashSet<&str> = space_keys.iter().map(String::as_str).collect();
        let spaces: Vec<Space> = self
            .api
            .list_spaces()
            .await?
            .into_iter()
            .filter(|s| wanted.contains(s.key.as_str()))
            .collect();
        if spaces.len() < wanted.len() {
            warn!(
                requested = wanted.len(),
                found = spaces.len(),
                "some requested spaces were not found"
            );
        }
        self.crawl_space_list(spaces, &filter, options.include_attachments)
            .await
    }

    /// Crawls explicit pages, optionally expanded to all descendants, minus exclusions.
    ///
    /// # Errors
    ///
    /// Fails only when every resolved page failed. A child listing or page
    /// fetch failure is counted in the report and the walk moves on.
    #[instrument(skip_all, fields(group = %self.ctx.group, pages = page_ids.len()))]
    pub async fn crawl_pages(
        &mut self,
        page_ids: &[String],
        options: &WikiPageOptions,
    ) -> Result<CrawlReport, ConnectorError> {
        let filter = AttachmentFilter::new(&options.banned_attachment_patterns)?;
        let mut report = CrawlReport::default();
        let mut ids = if options.include_child_pages {
            self.expand_descendants(page_ids, &mut report).await
        } else {
            page_ids.to_vec()
        };
        let excluded: HashSet<&str> = options.exclude_pages.iter().map(String::as_str).collect();
        ids.retain(|id| !excluded.contains(id.as_str()));
        info!(pages = ids.len(), "resolved page set");

        let mut tally = ItemTally::default();
        for id in &ids {
            let page = match self.api.get_page(id).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(page_id = %id, error = %e, "failed to fetch page");
                    tally.failed(&mut report, e.into());
                    continue;
                }
            };
            tally.succeeded();
            let space = self.space_for(&page.space_id).await;
            report.absorb(
                self.emit_page(&page, &space, &filter, options.include_attachments)
                    .await,
            );
        }
        tally.finish(report)
    }

    /// Breadth-first walk of child pages. Returns the roots followed by every
    /// descendant in discovery order, each id once. A page whose children
    /// cannot be listed is counted as failed and its subtree is not expanded.
    async fn expand_descendants(&self, roots: &[String], report: &mut CrawlReport) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut ordered = Vec::new();
        let mut queue = VecDeque::new();
        for root in roots {
            if seen.insert(root.clone()) {
                ordered.push(root.clone());
                queue.push_back(root.clone());
            }
        }
        while let Some(id) = queue.pop_front() {
            let children = match self.api.list_children(&id).await {
                Ok(children) => children,
                Err(e) => {
                    warn!(page_id = %id, error = %e, "failed to list child pages");
                    report.failed += 1;
                    continue;
                }
            };
            for child in children {
                if seen.insert(child.clone()) {
                    ordered.push(child.clone());
                    queue.push_back(child);
                }
            }
        }
        debug!(roots = roots.len(), total = ordered.len(), "expanded child pages");
        ordered
    }

    async fn crawl_space_list(
        &mut self,
        spaces: Vec<Space>,
        filter: &AttachmentFilter,
        include_attachments: bool,
    ) -> Result<CrawlReport, ConnectorError> {
        let mut report = CrawlReport::default();
        let mut tally = ItemTally::default();
        for space in spaces {
            self.spaces.insert(space.id.clone(), space.clone());
            let pages = match self.api.list_pages(&space.id).await {
                Ok(pages) => pages,
                Err(e) => {
                    warn!(space = %space.key, error = %e, "failed to list pages");
                    tally.failed(&mut report, e.into());
                    continue;
                }
            };
            tally.succeeded();
            info!(space = %space.key, pages = pages.len(), "found pages");
            for page in &pages {
                report.absorb(self.emit_page(page, &space, filter, include_attachments).await);
            }
        }
        tally.finish(report)
    }

    /// Space for a page, from the run cache or the API. Falls back to an
    /// unnamed space keyed by id when the lookup fails.
    async fn space_for(&mut self, space_id: &str) -> Space {
        if let Some(space) = self.spaces.get(space_id) {
            return space.clone();
        }
        let space = match self.api.get_space(space_id).await {
            Ok(space) => space,
            Err(e) => {
                warn!(space_id, error = %e, "space lookup failed, using id as key");
                Space {
                    id: space_id.to_string(),
                    key: space_id.to_string(),
                    name: String::new(),
                }
            }
        };
        self.spaces.insert(space_id.to_string(), space.clone());
        space
    }

    async fn emit_page(
        &self,
        page: &PageDocument,
        space: &Space,
        filter: &AttachmentFilter,
        include_attachments: bool,
    ) -> CrawlReport {
        let mut report = CrawlReport::default();
        match self.save_page(page, space).await {
            Ok(()) => report.emitted += 1,
            Err(e) => {
                warn!(page_id = %page.id, error = %e, "failed to save page");
                report.failed += 1;
                return report;
            }
        }
        if include_attachments {
            report.absorb(self.emit_attachments(page, space, filter).await);
        }
        tokio::time::sleep(self.item_delay).await;
        report
    }

    async fn save_page(&self, page: &PageDocument, space: &Space) -> Result<(), ConnectorError> {
        let output = &self.ctx.output;
        let group = &self.ctx.group;
        let file_name = build_filename(&format!("{} {}", space.key, page.id), "html");
        let path = output.prepare_document_path(group, &file_name).await?;
        output.save_document(&path, page.body.as_bytes()).await?;

        let record = MetadataRecord::new(
            &page.id,
            &page.title,
            &page.web_url,
            &page.created_at,
            "text/html",
            output.document_uri(group, &file_name),
        )
        .with_extra("spaceName", space.name.as_str());
        output.append_metadata_record(group, &record).await?;
        Ok(())
    }

    async fn emit_attachments(
        &self,
        page: &PageDocument,
        space: &Space,
        filter: &AttachmentFilter,
    ) -> CrawlReport {
        let mut report = CrawlReport::default();
        let referenced = referenced_attachments(&page.body);
        if referenced.is_empty() {
            return report;
        }
        let referenced: HashSet<&str> = referenced.iter().map(String::as_str).collect();

        let attachments = match self.api.list_page_attachments(&page.id).await {
            Ok(list) => list,
            Err(e) => {
                warn!(page_id = %page.id, error = %e, "failed to list attachments");
                report.failed += 1;
                return report;
            }
        };

        for attachment in attachments
            .iter()
            .filter(|a| referenced.contains(a.title.as_str()))
        {
            let mime = match filter.accept(&attachment.title) {
                Ok(mime) => mime,
                Err(reason) => {
                    debug!(title = %attachment.title, reason = reason.as_str(), "skipping attachment");
                    report.skipped += 1;
                    continue;
                }
            };
            match self.save_attachment(attachment, space, mime).await {
                Ok(()) => report.emitted += 1,
                Err(e) => {
                    warn!(attachment = %attachment.title, error = %e, "failed to save attachment");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn save_attachment(
        &self,
        attachment: &AttachmentDocument,
        space: &Space,
        mime: &str,
    ) -> Result<(), ConnectorError> {
        let output = &self.ctx.output;
        let group = &self.ctx.group;
        let extension = extension_of(&attachment.title).unwrap_or_default();
        let file_name = build_filename(&format!("{} {}", space.key, attachment.file_id), &extension);
        let path = output.prepare_document_path(group, &file_name).await?;
        self.api.download(&attachment.download_url, &path).await?;

        let record = MetadataRecord::new(
            &attachment.id,
            &attachment.title,
            &attachment.web_url,
            &attachment.created_at,
            mime,
            output.document_uri(group, &file_name),
        )
        .with_extra("spaceName", space.name.as_str());
        output.append_metadata_record(group, &record).await?;
        Ok(())
    }
}
