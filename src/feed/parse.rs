// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset, Utc};
use url::Url;

use crate::error::FeedError;
use crate::model::Candidate;

const UNTITLED: &str = "Untitled";

/// Parse RSS 2.0 or Atom bytes into candidates, in feed order.
///
/// Entries without any usable link are skipped.
pub fn parse_feed(bytes: &[u8], feed_url: &str) -> Result<Vec<Candidate>, FeedError> {
    let base = Url::parse(feed_url).ok();

    match rss::Channel::read_from(bytes) {
        Ok(channel) => Ok(channel
            .items()
            .iter()
            .filter_map(|item| parse_rss_item(item, base.as_ref()))
            .collect()),
        Err(rss_error) => match atom_syndication::Feed::read_from(bytes) {
            Ok(feed) => Ok(feed
                .entries()
                .iter()
                .filter_map(|entry| parse_atom_entry(entry, base.as_ref()))
                .collect()),
            Err(atom_error) => Err(FeedError::ParseFailed {
                url: feed_url.to_string(),
                reason: format!("not RSS ({rss_error}) nor Atom ({atom_error})"),
            }),
        },
    }
}

fn parse_rss_item(item: &rss::Item, base: Option<&Url>) -> Option<Candidate> {
    let link = item
        .enclosure()
        .map(|e| e.url())
        .or_else(|| item.link())
        .and_then(|l| absolutize(l, base))?;

    let title = item
        .title()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(UNTITLED)
        .to_string();

    let published_at = item
        .pub_date()
        .or_else(|| item.dublin_core_ext().and_then(|dc| dc.dates().first().map(String::as_str)))
        .and_then(parse_date);

    Some(Candidate {
        title,
        link,
        published_at,
    })
}

fn parse_atom_entry(entry: &atom_syndication::Entry, base: Option<&Url>) -> Option<Candidate> {
    let links = entry.links();
    let link = links
        .iter()
        .find(|l| l.rel() == "enclosure")
        .or_else(|| links.iter().find(|l| l.rel() == "alternate"))
        .or_else(|| links.first())
        .and_then(|l| absolutize(l.href(), base))?;

    let title = Some(entry.title().value.trim())
        .filter(|t| !t.is_empty())
        .unwrap_or(UNTITLED)
        .to_string();

    let published_at = entry
        .published()
        .copied()
        .unwrap_or(*entry.updated());

    Some(Candidate {
        title,
        link,
        published_at: Some(published_at.with_timezone(&Utc)),
    })
}

fn absolutize(link: &str, base: Option<&Url>) -> Option<String> {
    let link = link.trim();
    if link.is_empty() {
        return None;
    }
    match Url::parse(link) {
        Ok(url) => Some(url.to_string()),
        Err(_) => base.and_then(|b| b.join(link).ok()).map(|u| u.to_string()),
    }
}

fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .or_else(|_| DateTime::parse_from_rfc3339(date_str))
        .ok()
        .or_else(|| parse_relaxed_date(date_str))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Try to parse dates that don't strictly conform to RFC 2822
fn parse_relaxed_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str.trim(), format).ok())
}
