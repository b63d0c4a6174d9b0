//! Issue tracker REST (v3) calls and wire types.
//!
//! Search and comment listings are offset-paginated (`startAt`, `maxResults`,
//! `total`) and drained with [`fetch_offset_pages`] inside one retry scope.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::CustomField;
use crate::fetch::{ApiClient, FetchError, OffsetCursor, OffsetPage, RetryPolicy, fetch_offset_pages};

/// Page size requested from search and comment listings.
pub const SEARCH_PAGE_SIZE: u64 = 100;

/// An issue with the fields rendered into documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub id: String,
    pub key: String,
    pub issue_type: String,
    pub summary: String,
    pub project_name: String,
    pub project_id: String,
    pub labels: Vec<String>,
    pub created: String,
    pub updated: String,
    /// Rendered HTML description, if any.
    pub description: Option<String>,
    /// Configured custom fields that carry a value, as `(display name, text)`.
    pub custom_fields: Vec<(String, String)>,
}

/// One comment on an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub author: String,
    /// Rendered HTML body.
    pub body: String,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    start_at: u64,
    #[serde(default)]
    max_results: u64,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    issues: Vec<RawIssue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIssue {
    id: String,
    key: String,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    rendered_fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentResponse {
    #[serde(default)]
    start_at: u64,
    #[serde(default)]
    max_results: u64,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    comments: Vec<RawComment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawComment {
    author: Option<RawAuthor>,
    #[serde(default)]
    rendered_body: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    updated: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAuthor {
    #[serde(default)]
    display_name: String,
}

/// Tracker endpoints bound to one authenticated client.
#[derive(Debug, Clone)]
pub struct IssueApi {
    client: ApiClient,
    retry: RetryPolicy,
    base_url: String,
    custom_fields: Vec<CustomField>,
}

impl IssueApi {
    /// Wraps a client whose base URL is the tracker site root.
    #[must_use]
    pub fn new(client: ApiClient, retry: RetryPolicy, custom_fields: Vec<CustomField>) -> Self {
        let base_url = client
            .base_url()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .unwrap_or_default();
        Self {
            client,
            retry,
            base_url,
            custom_fields,
        }
    }

    /// Browser link for an issue.
    #[must_use]
    pub fn browse_url(&self, key: &str) -> String {
        format!("{}/browse/{key}", self.base_url)
    }

    /// Every issue matching `jql`, in result order.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted. A failure on any page
    /// restarts the search from the first page.
    pub async fn search(&self, jql: &str) -> Result<Vec<Issue>, FetchError> {
        let client = &self.client;
        let raw = self
            .retry
            .run("issue search", move || {
                fetch_offset_pages(SEARCH_PAGE_SIZE, move |cursor| {
                    search_page(client, jql, cursor)
                })
            })
            .await?;
        Ok(raw
            .into_iter()
            .map(|issue| issue_from_raw(issue, &self.custom_fields))
            .collect())
    }

    /// Every epic of a project.
    ///
    /// # Errors
    ///
    /// See [`search`](Self::search).
    pub async fn epics(&self, project: &str) -> Result<Vec<Issue>, FetchError> {
        self.search(&format!("project = \"{project}\" AND issuetype = Epic"))
            .await
    }

    /// Every issue whose parent is `epic_key`.
    ///
    /// # Errors
    ///
    /// See [`search`](Self::search).
    pub async fn children_of(&self, epic_key: &str) -> Result<Vec<Issue>, FetchError> {
        self.search(&format!("parent = \"{epic_key}\"")).await
    }

    /// The full comment thread of an issue, oldest first.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted.
    pub async fn comments(&self, key: &str) -> Result<Vec<Comment>, FetchError> {
        let client = &self.client;
        let path = format!("/rest/api/3/issue/{key}/comment");
        let path = path.as_str();
        let raw = self
            .retry
            .run("issue comments", move || {
                fetch_offset_pages(SEARCH_PAGE_SIZE, move |cursor| {
                    comment_page(client, path, cursor)
                })
            })
            .await?;
        Ok(raw
            .into_iter()
            .map(|c| Comment {
                author: c.author.map(|a| a.display_name).unwrap_or_default(),
                body: c.rendered_body,
                created: c.created,
                updated: c.updated,
            })
            .collect())
    }
}

async fn search_page(
    client: &ApiClient,
    jql: &str,
    cursor: OffsetCursor,
) -> Result<OffsetPage<RawIssue>, FetchError> {
    let start_at = cursor.start_at.to_string();
    let max_results = cursor.page_size.to_string();
    let url = client.url_with_query(
        "/rest/api/3/search",
        &[
            ("jql", jql),
            ("startAt", &start_at),
            ("maxResults", &max_results),
            ("expand", "renderedFields"),
        ],
    )?;
    let body: SearchResponse = client.get_json(&url).await?;
    debug!(start_at = body.start_at, returned = body.issues.len(), total = body.total, "search page");
    Ok(OffsetPage {
        items: body.issues,
        start_at: body.start_at,
        page_size: body.max_results,
        total: body.total,
    })
}

async fn comment_page(
    client: &ApiClient,
    path: &str,
    cursor: OffsetCursor,
) -> Result<OffsetPage<RawComment>, FetchError> {
    let start_at = cursor.start_at.to_string();
    let max_results = cursor.page_size.to_string();
    let url = client.url_with_query(
        path,
        &[
            ("startAt", &start_at),
            ("maxResults", &max_results),
            ("expand", "renderedBody"),
        ],
    )?;
    let body: CommentResponse = client.get_json(&url).await?;
    Ok(OffsetPage {
        items: body.comments,
        start_at: body.start_at,
        page_size: body.max_results,
        total: body.total,
    })
}

fn issue_from_raw(raw: RawIssue, custom_fields: &[CustomField]) -> Issue {
    let fields = &raw.fields;
    let nested = |outer: &str, inner: &str| {
        fields
            .get(outer)
            .and_then(|v| v.get(inner))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let plain = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let labels = fields
        .get("labels")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let description = raw
        .rendered_fields
        .get("description")
        .and_then(Value::as_str)
        .filter(|d| !d.trim().is_empty())
        .map(str::to_string);

    let custom_fields = custom_fields
        .iter()
        .filter_map(|cf| {
            fields
                .get(&cf.field)
                .and_then(field_text)
                .map(|text| (cf.name.clone(), text))
        })
        .collect();

    Issue {
        issue_type: nested("issuetype", "name"),
        summary: plain("summary"),
        project_name: nested("project", "name"),
        project_id: nested("project", "id"),
        labels,
        created: plain("created"),
        updated: plain("updated"),
        description,
        custom_fields,
        id: raw.id,
        key: raw.key,
    }
}

/// Text form of a custom field value; `None` when the field is empty.
fn field_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(field_text).collect();
            parts.join(", ")
        }
        Value::Object(map) => ["value", "name", "displayName", "key"]
            .iter()
            .find_map(|k| map.get(*k).and_then(field_text))?,
    };
    (!text.is_empty()).then_some(text)
}
