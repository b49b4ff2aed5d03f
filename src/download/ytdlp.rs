// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{DownloadedMedia, Downloader};
use crate::error::DownloadError;
use crate::model::{SourceType, Task};

const DEFAULT_PROGRAM: &str = "yt-dlp";

/// Output template relative to the media directory
const OUTPUT_TEMPLATE: &str = "%(artist,channel,uploader|Unknown)s/%(release_date>%Y-%m-%d,upload_date>%Y-%m-%d|undated)s-%(title)s.%(ext)s";

/// Hands video and audio links to an external `yt-dlp` process
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    program: String,
}

impl Default for YtDlpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpDownloader {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    /// Use a different executable, e.g. a pinned yt-dlp build
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Command-line arguments for downloading `task` into `media_dir`
pub fn ytdlp_args(task: &Task, media_dir: &Path) -> Vec<String> {
    let mut args: Vec<String> = match task.kind {
        SourceType::Audio => vec![
            "-f",
            "ba[acodec=opus]/ba/b",
            "--extract-audio",
            "--audio-format",
            "opus",
        ],
        _ => vec![
            "-f",
            "(bv[vcodec^=vp9][height<=1080]/bv[height<=1080]/bv)+(ba[acodec=opus]/ba/b)",
            "--merge-output-format",
            "mkv",
        ],
    }
    .into_iter()
    .map(String::from)
    .collect();

    args.extend(
        [
            "--embed-thumbnail",
            "--embed-metadata",
            "--no-progress",
            "--no-simulate",
            "--print",
            "after_move:filepath",
        ]
        .map(String::from),
    );
    args.push("-o".to_string());
    args.push(media_dir.join(OUTPUT_TEMPLATE).to_string_lossy().into_owned());
    args.push("--".to_string());
    args.push(task.link.clone());
    args
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    #[instrument(skip_all, fields(link = %task.link, kind = ?task.kind))]
    async fn fetch(&self, task: &Task, media_dir: &Path) -> Result<DownloadedMedia, DownloadError> {
        let args = ytdlp_args(task, media_dir);
        debug!(program = %self.program, "Running downloader process");

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DownloadError::ProcessSpawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DownloadError::ProcessFailed {
                program: self.program.clone(),
                url: task.link.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().lines().last().unwrap_or_default().to_string(),
            });
        }

        // The final path is the last non-empty line yt-dlp prints
        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| DownloadError::OutputUnknown {
                url: task.link.clone(),
            })?;

        Ok(DownloadedMedia {
            path,
            content_hash: None,
        })
    }
}
