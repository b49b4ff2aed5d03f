// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a configured source, which also decides how its items are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// Any RSS/Atom feed; items are downloaded over plain HTTP
    #[default]
    Generic,
    /// A YouTube channel feed; items are fetched with yt-dlp
    YoutubeChannel,
    /// Video feed fetched with yt-dlp
    Video,
    /// Audio-only extraction with yt-dlp
    Audio,
}

impl SourceType {
    /// Whether items of this kind are handed to yt-dlp instead of streamed over HTTP
    pub fn uses_ytdlp(self) -> bool {
        !matches!(self, SourceType::Generic)
    }
}

/// A feed origin the daemon polls
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: SourceType,
}

impl Source {
    pub fn new(url: impl Into<String>, kind: SourceType) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }
}

/// A feed entry that has not yet been run through the download filter
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub title: String,
    pub link: String,
    /// `None` when the feed carried no usable date
    pub published_at: Option<DateTime<Utc>>,
}

/// An item waiting for a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub title: String,
    pub link: String,
    #[serde(rename = "type", default)]
    pub kind: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,
}

impl QueueEntry {
    pub fn from_candidate(candidate: Candidate, kind: SourceType) -> Self {
        Self {
            title: candidate.title,
            link: candidate.link,
            kind,
            published_at: candidate.published_at,
            attempts: 0,
        }
    }

    /// Promote to an in-progress task; the attempt number counts this try
    pub fn into_task(self, started_at: DateTime<Utc>) -> Task {
        Task {
            title: self.title,
            link: self.link,
            kind: self.kind,
            published_at: self.published_at,
            attempt: self.attempts + 1,
            started_at,
            retry_at: None,
        }
    }
}

/// An in-progress download owned by one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    pub link: String,
    #[serde(rename = "type", default)]
    pub kind: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    /// Set while the task waits out a retry backoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Demote back to a queue entry, keeping the attempt count
    pub fn into_entry(self) -> QueueEntry {
        QueueEntry {
            title: self.title,
            link: self.link,
            kind: self.kind,
            published_at: self.published_at,
            attempts: self.attempt,
        }
    }
}

/// A successfully downloaded item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub title: String,
    pub link: String,
    pub downloaded_at: DateTime<Utc>,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// A download that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub title: String,
    pub link: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
