// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turning a human-entered channel URL into a machine-readable feed URL.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::SourceError;
use crate::http::HttpClient;

static CHANNEL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://)?(?:www\.|m\.)?youtube\.com/(?:c/|@|channel/|user/)[^/?#]+")
        .expect("valid channel URL pattern")
});

static CHANNEL_ID_IN_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"youtube\.com/channel/(UC[0-9A-Za-z_-]{22})").expect("valid channel path pattern")
});

/// Patterns that carry the channel id inside a channel page
static CHANNEL_ID_IN_PAGE: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    [
        r#""externalId"\s*:\s*"(UC[0-9A-Za-z_-]{22})""#,
        r"channel_id=(UC[0-9A-Za-z_-]{22})",
        r#""channelId"\s*:\s*"(UC[0-9A-Za-z_-]{22})""#,
        r"/channel/(UC[0-9A-Za-z_-]{22})",
    ]
    .map(|p| Regex::new(p).expect("valid channel id pattern"))
});

const FEED_BASE: &str = "https://www.youtube.com/feeds/videos.xml?channel_id=";

/// Whether `url` looks like a channel page that must be resolved to a feed
pub fn is_channel_url(url: &str) -> bool {
    CHANNEL_URL.is_match(url.trim())
}

/// Feed URL for a channel id
pub fn channel_feed_url(channel_id: &str) -> String {
    format!("{FEED_BASE}{channel_id}")
}

/// Find a channel id in the page HTML
pub fn extract_channel_id(html: &str) -> Option<String> {
    CHANNEL_ID_IN_PAGE
        .iter()
        .find_map(|re| re.captures(html))
        .map(|caps| caps[1].to_string())
}

/// Resolve a channel URL to its feed URL, fetching the page when needed
pub async fn resolve_channel<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<String, SourceError> {
    let url = url.trim();
    let unresolvable = |reason: String| SourceError::Unresolvable {
        url: url.to_string(),
        reason,
    };

    if !is_channel_url(url) {
        return Err(unresolvable("not a channel URL".to_string()));
    }

    if let Some(caps) = CHANNEL_ID_IN_PATH.captures(url) {
        return Ok(channel_feed_url(&caps[1]));
    }

    let page_url = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };

    debug!(url = %page_url, "Fetching channel page");
    let response = client
        .get_bytes(&page_url)
        .await
        .map_err(|e| unresolvable(e.to_string()))?;
    if response.status >= 400 {
        return Err(unresolvable(format!("HTTP error {}", response.status)));
    }

    let html = String::from_utf8_lossy(&response.body);
    extract_channel_id(&html)
        .map(|id| channel_feed_url(&id))
        .ok_or_else(|| unresolvable("no channel id found on page".to_string()))
}
