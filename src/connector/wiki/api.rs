//! Wiki REST (v2) calls and wire types.
//!
//! Every listing endpoint returns `{ "results": [...], "_links": { "next": "..." } }`
//! and is drained with [`fetch_link_pages`] inside one retry scope.

use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::fetch::{ApiClient, FetchError, LinkPage, RetryPolicy, fetch_link_pages};

/// Page size requested from listing endpoints.
pub const LIST_LIMIT: &str = "250";

/// A wiki space.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Space {
    pub id: String,
    pub key: String,
    pub name: String,
}

/// A page with its storage-format body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDocument {
    pub id: String,
    pub title: String,
    /// Raw storage markup.
    pub body: String,
    pub web_url: String,
    pub created_at: String,
    pub space_id: String,
}

/// A file attached to a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDocument {
    pub id: String,
    /// File name as uploaded.
    pub title: String,
    pub media_type: String,
    pub web_url: String,
    pub download_url: String,
    pub created_at: String,
    pub page_id: String,
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    next: Option<String>,
    webui: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "spaceId", default)]
    space_id: String,
    body: Option<RawBody>,
    version: Option<RawVersion>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Debug, Deserialize)]
struct RawBody {
    storage: Option<RawStorage>,
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawVersion {
    #[serde(rename = "createdAt", default)]
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct RawChild {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAttachment {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    media_type: String,
    #[serde(default)]
    page_id: String,
    #[serde(default)]
    file_id: String,
    #[serde(default)]
    webui_link: String,
    #[serde(default)]
    download_link: String,
    version: Option<RawVersion>,
}

/// Wiki endpoints bound to one authenticated client.
#[derive(Debug, Clone)]
pub struct WikiApi {
    client: ApiClient,
    retry: RetryPolicy,
    base_url: String,
}

impl WikiApi {
    /// Wraps a client whose base URL is the site root (e.g. `https://acme.atlassian.net`).
    #[must_use]
    pub fn new(client: ApiClient, retry: RetryPolicy) -> Self {
        let base_url = client
            .base_url()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .unwrap_or_default();
        Self {
            client,
            retry,
            base_url,
        }
    }

    /// All current global spaces.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted.
    pub async fn list_spaces(&self) -> Result<Vec<Space>, FetchError> {
        let first = self.client.url_with_query(
            "/wiki/api/v2/spaces",
            &[("type", "global"), ("status", "current"), ("limit", LIST_LIMIT)],
        )?;
        self.list_all("wiki spaces", first).await
    }

    /// A single space by id.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted.
    pub async fn get_space(&self, space_id: &str) -> Result<Space, FetchError> {
        let path = format!("/wiki/api/v2/spaces/{space_id}");
        self.retry
            .run("wiki space", || self.client.get_json::<Space>(&path))
            .await
    }

    /// Current pages of a space with storage bodies, in API order.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted.
    pub async fn list_pages(&self, space_id: &str) -> Result<Vec<PageDocument>, FetchError> {
        let first = self.client.url_with_query(
            "/wiki/api/v2/pages",
            &[
                ("space-id", space_id),
                ("status", "current"),
                ("body-format", "storage"),
                ("limit", LIST_LIMIT),
            ],
        )?;
        let raw: Vec<RawPage> = self.list_all("wiki pages", first).await?;
        Ok(raw.into_iter().map(|p| self.page_document(p)).collect())
    }

    /// One page by id with its storage body.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted.
    pub async fn get_page(&self, page_id: &str) -> Result<PageDocument, FetchError> {
        let url = self.client.url_with_query(
            &format!("/wiki/api/v2/pages/{page_id}"),
            &[("body-format", "storage")],
        )?;
        let raw = self
            .retry
            .run("wiki page", || self.client.get_json::<RawPage>(&url))
            .await?;
        Ok(self.page_document(raw))
    }

    /// Ids of the direct children of a page.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted.
    pub async fn list_children(&self, page_id: &str) -> Result<Vec<String>, FetchError> {
        let first = self.client.url_with_query(
            &format!("/wiki/api/v2/pages/{page_id}/children"),
            &[("limit", LIST_LIMIT)],
        )?;
        let children: Vec<RawChild> = self.list_all("wiki children", first).await?;
        Ok(children.into_iter().map(|c| c.id).collect())
    }

    /// Current attachments of a page.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted.
    pub async fn list_page_attachments(
        &self,
        page_id: &str,
    ) -> Result<Vec<AttachmentDocument>, FetchError> {
        let first = self.client.url_with_query(
            &format!("/wiki/api/v2/pages/{page_id}/attachments"),
            &[("status", "current"), ("limit", LIST_LIMIT)],
        )?;
        let raw: Vec<RawAttachment> = self.list_all("wiki attachments", first).await?;
        Ok(raw
            .into_iter()
            .map(|a| AttachmentDocument {
                web_url: format!("{}/wiki{}", self.base_url, a.webui_link),
                download_url: format!("{}/wiki{}", self.base_url, a.download_link),
                created_at: a.version.map(|v| v.created_at).unwrap_or_default(),
                id: a.id,
                title: a.title,
                media_type: a.media_type,
                page_id: a.page_id,
                file_id: a.file_id,
            })
            .collect())
    }

    /// Streams an attachment to disk.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted.
    pub async fn download(&self, url: &str, destination: &Path) -> Result<u64, FetchError> {
        self.retry
            .run("wiki download", || self.client.download_to_file(url, destination))
            .await
    }

    async fn list_all<T: DeserializeOwned>(
        &self,
        label: &str,
        first: String,
    ) -> Result<Vec<T>, FetchError> {
        let client = &self.client;
        self.retry
            .run(label, || {
                fetch_link_pages(first.clone(), move |link| fetch_listing::<T>(client, link))
            })
            .await
    }

    fn page_document(&self, raw: RawPage) -> PageDocument {
        let relative = raw.links.webui.as_deref().unwrap_or_default();
        PageDocument {
            web_url: format!("{}{}", self.base_url, canonical_page_path(relative)),
            body: raw
                .body
                .and_then(|b| b.storage)
                .map(|s| s.value)
                .unwrap_or_default(),
            created_at: raw.version.map(|v| v.created_at).unwrap_or_default(),
            id: raw.id,
            title: raw.title,
            space_id: raw.space_id,
        }
    }
}

async fn fetch_listing<T: DeserializeOwned>(
    client: &ApiClient,
    link: String,
) -> Result<LinkPage<T>, FetchError> {
    let listing: Listing<T> = client.get_json(&link).await?;
    debug!(results = listing.results.len(), has_next = listing.links.next.is_some(), "listing page");
    Ok(LinkPage {
        items: listing.results,
        next: listing.links.next,
    })
}

/// Shortens a page's web UI link to `/wiki/spaces/<KEY>/pages/<id>`.
///
/// Links that do not point at a page are kept under `/wiki` unchanged.
fn canonical_page_path(webui: &str) -> String {
    let segments: Vec<&str> = webui.split('/').filter(|s| !s.is_empty()).collect();
    if let Some(pos) = segments.windows(4).position(|w| {
        w[0] == "spaces" && w[2] == "pages" && !w[3].is_empty() && w[3].bytes().all(|b| b.is_ascii_digit())
    }) {
        let w = &segments[pos..pos + 4];
        return format!("/wiki/spaces/{}/pages/{}", w[1], w[3]);
    }
    if webui.is_empty() || webui.starts_with("/wiki") {
        webui.to_string()
    } else {
        format!("/wiki{webui}")
    }
}
