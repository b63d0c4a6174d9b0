//! Shared User-Agent strings for API and web crawl traffic.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/harvester";

/// Fixed browser User-Agent sent by the web crawler.
///
/// Many sites serve stripped or blocked pages to unknown agents, so web pages
/// are always fetched as a desktop browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Default User-Agent for wiki, issue tracker and dataset API requests.
#[must_use]
pub(crate) fn default_api_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("harvester/{version} (+{PROJECT_UA_URL})")
}
