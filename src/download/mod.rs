mod filename;
mod http;
mod retry;
mod ytdlp;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::DownloadError;
use crate::model::Task;

pub use filename::{filename_stem, media_extension};
pub use self::http::{HttpDownloader, cleanup_partial_files};
pub use retry::{DEFAULT_MAX_ATTEMPTS, MAX_DELAY, RetryDecision, RetryPolicy};
pub use ytdlp::{YtDlpDownloader, ytdlp_args};

/// A finished download on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedMedia {
    pub path: PathBuf,
    /// `sha256:<hex>` when the content was hashed while downloading
    pub content_hash: Option<String>,
}

/// Fetches one task's media into the media directory
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, task: &Task, media_dir: &Path) -> Result<DownloadedMedia, DownloadError>;
}

/// Routes each task to HTTP streaming or yt-dlp depending on its source type
pub struct MediaDownloader<H, Y> {
    http: H,
    ytdlp: Y,
}

impl<H: Downloader, Y: Downloader> MediaDownloader<H, Y> {
    pub fn new(http: H, ytdlp: Y) -> Self {
        Self { http, ytdlp }
    }
}

#[async_trait]
impl<H: Downloader, Y: Downloader> Downloader for MediaDownloader<H, Y> {
    async fn fetch(&self, task: &Task, media_dir: &Path) -> Result<DownloadedMedia, DownloadError> {
        if task.kind.uses_ytdlp() {
            self.ytdlp.fetch(task, media_dir).await
        } else {
            self.http.fetch(task, media_dir).await
        }
    }
}
