//! Depth-bounded recursive web crawl.
//!
//! A [`WebCrawlSession`] is created per `web/url` target and owns its
//! [`VisitedSet`], so dedup state never leaks between targets or groups.
//! For each URL the session:
//!
//! 1. stops when no depth is left;
//! 2. normalizes the URL (scheme, host, port and path) and stops if it was
//!    already visited or matches a banned URL pattern;
//! 3. marks it visited, then fetches it with retries;
//! 4. stops without emitting if the page title matches a banned title pattern;
//! 5. saves the page as `web <id> <title>.html`, with `id` the SHA-256 of the
//!    normalized URL;
//! 6. when links are followed, recurses depth-first into every `a[href]`
//!    target that matches the allow pattern and no banned URL pattern.
//!
//! The `depth` option counts link hops from a seed: `0` fetches only the
//! seed, `1` also fetches the pages it links to.

use std::future::Future;
use std::pin::Pin;

use chrono::{SecondsFormat, Utc};
use dashmap::DashSet;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::filter::{compile_patterns, matches_any};
use super::{ConnectorError, CrawlContext, CrawlReport, ItemTally};
use crate::fetch::{ApiClient, FetchError};
use crate::output::{MetadataRecord, build_filename};
use crate::user_agent::BROWSER_USER_AGENT;

/// Title recorded for pages without a `<title>`.
pub const UNTITLED_PAGE: &str = "No title";

/// Options for `web/url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebOptions {
    /// Follow links found on fetched pages.
    pub include_links: bool,
    /// Links are only followed when their absolute URL matches this pattern.
    pub regex: String,
    pub banned_url_patterns: Vec<String>,
    pub banned_title_patterns: Vec<String>,
    /// Link hops to follow from each seed.
    pub depth: u32,
}

impl Default for WebOptions {
    fn default() -> Self {
        Self {
            include_links: false,
            regex: ".*".to_string(),
            banned_url_patterns: Vec::new(),
            banned_title_patterns: Vec::new(),
            depth: 1,
        }
    }
}

/// Normalized URLs already claimed by one crawl session.
///
/// Only grows; checking and marking is a single atomic step.
#[derive(Debug, Default)]
pub struct VisitedSet {
    urls: DashSet<String>,
}

impl VisitedSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `url` visited. Returns `false` if it already was.
    pub fn insert_if_new(&self, url: &str) -> bool {
        self.urls.insert(url.to_string())
    }

    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.urls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Keeps scheme, host, port and path; drops credentials, query and fragment.
///
/// # Errors
///
/// [`FetchError::InvalidUrl`] when `raw` is not an absolute URL.
pub fn normalize_url(raw: &str) -> Result<String, FetchError> {
    let mut url = Url::parse(raw).map_err(|_| FetchError::invalid_url(raw))?;
    url.set_query(None);
    url.set_fragment(None);
    // Only fails for cannot-be-a-base URLs, which have no credentials anyway.
    let _ = url.set_username("");
    let _ = url.set_password(None);
    Ok(url.to_string())
}

/// Stable page id: hex SHA-256 of the normalized URL.
#[must_use]
pub fn page_id(normalized_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Title and absolute http(s) link targets of a page, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPage {
    pub title: String,
    pub links: Vec<String>,
}

/// Extracts the title and links of `html`, resolving links against `page_url`.
#[must_use]
pub fn parse_page(html: &str, page_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED_PAGE.to_string());

    let links = Selector::parse("a[href]")
        .map(|selector| {
            document
                .select(&selector)
                .filter_map(|el| el.value().attr("href"))
                .filter_map(|href| page_url.join(href.trim()).ok())
                .filter(|url| matches!(url.scheme(), "http" | "https"))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    ParsedPage { title, links }
}

type CrawlFuture<'s> = Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + 's>>;

/// One web target invocation: visited set, patterns and running report.
pub struct WebCrawlSession<'a> {
    ctx: &'a CrawlContext,
    client: ApiClient,
    visited: VisitedSet,
    include_links: bool,
    depth: u32,
    allow: Regex,
    banned_urls: Vec<Regex>,
    banned_titles: Vec<Regex>,
    report: CrawlReport,
}

impl<'a> WebCrawlSession<'a> {
    /// Compiles the patterns of `options` into a fresh session.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::Pattern`] for an invalid pattern.
    pub fn new(ctx: &'a CrawlContext, options: &WebOptions) -> Result<Self, ConnectorError> {
        let allow = Regex::new(&options.regex).map_err(|source| ConnectorError::Pattern {
            pattern: options.regex.clone(),
            source,
        })?;
        Ok(Self {
            ctx,
            client: ApiClient::unbound(BROWSER_USER_AGENT)?,
            visited: VisitedSet::new(),
            include_links: options.include_links,
            depth: options.depth,
            allow,
            banned_urls: compile_patterns(&options.banned_url_patterns)?,
            banned_titles: compile_patterns(&options.banned_title_patterns)?,
            report: CrawlReport::default(),
        })
    }

    #[must_use]
    pub fn visited(&self) -> &VisitedSet {
        &self.visited
    }

    #[must_use]
    pub fn report(&self) -> CrawlReport {
        self.report
    }

    /// Crawls from one seed URL with the configured depth.
    ///
    /// # Errors
    ///
    /// Fails when the seed itself cannot be fetched or saved. Failures on
    /// linked pages are counted in the report.
    #[instrument(skip(self), fields(group = %self.ctx.group))]
    pub async fn seed(&mut self, url: &str) -> Result<(), ConnectorError> {
        let levels = self.depth.saturating_add(1);
        self.crawl(url.to_string(), levels).await
    }

    /// Visits `url` with `levels` pages left on this branch, `0` meaning none.
    fn crawl(&mut self, url: String, levels: u32) -> CrawlFuture<'_> {
        Box::pin(async move {
            if levels == 0 {
                return Ok(());
            }
            let normalized = normalize_url(&url)?;
            if self.visited.contains(&normalized) {
                debug!(url = %normalized, "already visited");
                return Ok(());
            }
            if matches_any(&self.banned_urls, &normalized) {
                debug!(url = %normalized, "banned url, skipping");
                self.report.skipped += 1;
                return Ok(());
            }
            if !self.visited.insert_if_new(&normalized) {
                return Ok(());
            }

            let client = &self.client;
            let html = self
                .ctx
                .retry
                .run("web page", || client.get_text(&url))
                .await?;

            let page_url = Url::parse(&url).map_err(|_| FetchError::invalid_url(url.as_str()))?;
            let page = parse_page(&html, &page_url);
            if matches_any(&self.banned_titles, &page.title) {
                info!(url = %normalized, title = %page.title, "banned title, not saving");
                self.report.skipped += 1;
                return Ok(());
            }

            self.save(&url, &normalized, &page.title, &html).await?;
            self.report.emitted += 1;

            if !self.include_links || levels <= 1 {
                return Ok(());
            }
            let links: Vec<String> = page
                .links
                .into_iter()
                .filter(|link| self.allow.is_match(link))
                .filter(|link| !matches_any(&self.banned_urls, link))
                .collect();
            debug!(url = %normalized, links = links.len(), "following links");

            for link in links {
                if let Err(e) = self.crawl(link.clone(), levels - 1).await {
                    warn!(url = %link, error = %e, "failed to crawl linked page");
                    self.report.failed += 1;
                }
            }
            Ok(())
        })
    }

    async fn save(
        &self,
        url: &str,
        normalized: &str,
        title: &str,
        html: &str,
    ) -> Result<(), ConnectorError> {
        let output = &self.ctx.output;
        let group = &self.ctx.group;
        let id = page_id(normalized);
        let file_name = build_filename(&format!("web {id} {title}"), "html");
        let path = output.prepare_document_path(group, &file_name).await?;
        output.save_document(&path, html.as_bytes()).await?;

        let record = MetadataRecord::new(
            &id,
            title,
            url,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "text/html",
            output.document_uri(group, &file_name),
        );
        output.append_metadata_record(group, &record).await?;
        Ok(())
    }
}

/// Runs one `web/url` target: a single session over all seeds.
///
/// A seed that cannot be fetched is counted as failed and the next seed is
/// crawled.
///
/// # Errors
///
/// Fails when the patterns are invalid or when every seed failed.
pub async fn crawl_seeds(
    ctx: &CrawlContext,
    seeds: &[String],
    options: &WebOptions,
) -> Result<CrawlReport, ConnectorError> {
    let mut session = WebCrawlSession::new(ctx, options)?;
    let mut tally = ItemTally::default();
    for seed in seeds {
        match session.seed(seed).await {
            Ok(()) => tally.succeeded(),
            Err(e) => {
                warn!(url = %seed, error = %e, "failed to crawl seed");
                tally.failed(&mut session.report, e);
            }
        }
    }
    info!(
        group = %ctx.group,
        visited = session.visited().len(),
        emitted = session.report().emitted,
        failed = session.report().failed,
        "web crawl finished"
    );
    tally.finish(session.report())
}
