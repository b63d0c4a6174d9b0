//! Cursor-following pagination.
//!
//! Three response styles are supported, all of which concatenate items in
//! response order without sorting or dedup:
//!
//! - offset ([`fetch_offset_pages`]): `startAt`/`maxResults`/`total`, advancing
//!   by exactly one page each time;
//! - link ([`fetch_link_pages`]): follow an opaque next-page URL until absent;
//! - numbered ([`fetch_numbered_pages`]): `page=1,2,...` until `has_more` is false.
//!
//! None of these catch errors. Wrap the whole call in
//! [`RetryPolicy::run`](super::RetryPolicy::run) so a failure restarts from
//! the first page.

use std::future::Future;

use tracing::debug;

use super::FetchError;

/// Position requested from an offset-paginated endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetCursor {
    /// Index of the first item to return.
    pub start_at: u64,
    /// Requested page size.
    pub page_size: u64,
}

/// One page of an offset-paginated response.
#[derive(Debug, Clone)]
pub struct OffsetPage<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Offset the server reports for this page. Informational only; the
    /// next request is computed from the requested cursor.
    pub start_at: u64,
    /// Page size the server actually applied (may be smaller than requested).
    pub page_size: u64,
    /// Total number of items across all pages.
    pub total: u64,
}

/// One page of a link-paginated response.
#[derive(Debug, Clone)]
pub struct LinkPage<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Path or URL of the next page, if any.
    pub next: Option<String>,
}

/// One page of a page-number-paginated response.
#[derive(Debug, Clone)]
pub struct NumberedPage<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Whether another page follows.
    pub has_more: bool,
}

/// Fetches every page of an offset-paginated endpoint.
///
/// Continues while `start_at + page_size < total`, requesting
/// `start_at + page_size` next. `start_at` is the offset this loop asked
/// for, never the one echoed back by the server.
///
/// # Errors
///
/// Propagates the first error returned by `request`.
pub async fn fetch_offset_pages<T, F, Fut>(
    page_size: u64,
    mut request: F,
) -> Result<Vec<T>, FetchError>
where
    F: FnMut(OffsetCursor) -> Fut,
    Fut: Future<Output = Result<OffsetPage<T>, FetchError>>,
{
    let mut cursor = OffsetCursor {
        start_at: 0,
        page_size,
    };
    let mut all = Vec::new();

    loop {
        let page = request(cursor).await?;
        let returned = page.items.len();
        all.extend(page.items);

        let applied = if page.page_size == 0 {
            page_size
        } else {
            page.page_size
        };
        let next = cursor.start_at + applied;
        debug!(start_at = cursor.start_at, returned, total = page.total, "offset page fetched");

        // An empty page would never advance.
        if next >= page.total || returned == 0 {
            break;
        }
        cursor.start_at = next;
    }

    Ok(all)
}

/// Fetches every page of a link-paginated endpoint starting at `first`.
///
/// # Errors
///
/// Propagates the first error returned by `request`.
pub async fn fetch_link_pages<T, F, Fut>(first: String, mut request: F) -> Result<Vec<T>, FetchError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<LinkPage<T>, FetchError>>,
{
    let mut all = Vec::new();
    let mut next = Some(first);
    let mut pages = 0usize;

    while let Some(link) = next {
        let page = request(link).await?;
        pages += 1;
        all.extend(page.items);
        next = page.next.filter(|n| !n.is_empty());
    }

    debug!(pages, items = all.len(), "link pagination complete");
    Ok(all)
}

/// Fetches every page of a page-number endpoint, starting at page 1.
///
/// # Errors
///
/// Propagates the first error returned by `request`.
pub async fn fetch_numbered_pages<T, F, Fut>(mut request: F) -> Result<Vec<T>, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<NumberedPage<T>, FetchError>>,
{
    let mut all = Vec::new();
    let mut page_number = 1;

    loop {
        let page = request(page_number).await?;
        let returned = page.items.len();
        all.extend(page.items);
        if !page.has_more || returned == 0 {
            break;
        }
        page_number += 1;
    }

    Ok(all)
}
