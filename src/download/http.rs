// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::filename::{candidate_paths, filename_stem, media_extension, partial_path};
use super::{DownloadedMedia, Downloader};
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::model::Task;

/// Upper bound on `-N` suffixes tried for one name
const MAX_NAME_CANDIDATES: usize = 10_000;

/// Claim a free output name by creating its `.partial` file exclusively.
///
/// Concurrent downloads of items with the same title race on the
/// `create_new`, so each ends up with its own name. Returns the final path,
/// the partial path and the open partial file.
async fn create_partial(dir: &Path, stem: &str, ext: &str) -> Result<(PathBuf, PathBuf, File), DownloadError> {
    for output in candidate_paths(dir, stem, ext).take(MAX_NAME_CANDIDATES) {
        if tokio::fs::try_exists(&output).await.unwrap_or(true) {
            continue;
        }
        let partial = partial_path(&output);
        match OpenOptions::new().write(true).create_new(true).open(&partial).await {
            Ok(file) => return Ok((output, partial, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(DownloadError::FileCreateFailed {
                    path: partial,
                    source: e,
                });
            }
        }
    }
    Err(DownloadError::FileCreateFailed {
        path: dir.join(format!("{stem}.{ext}")),
        source: std::io::Error::new(ErrorKind::AlreadyExists, "no free file name left"),
    })
}

/// Streams a task's link straight to disk.
///
/// The body goes to a `.partial` file that is renamed into place once the
/// stream is complete; a SHA-256 of the content is computed on the way.
pub struct HttpDownloader<C> {
    client: C,
}

impl<C: HttpClient> HttpDownloader<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> Downloader for HttpDownloader<C> {
    #[instrument(skip_all, fields(link = %task.link))]
    async fn fetch(&self, task: &Task, media_dir: &Path) -> Result<DownloadedMedia, DownloadError> {
        let url = task.link.as_str();

        tokio::fs::create_dir_all(media_dir)
            .await
            .map_err(|e| DownloadError::FileCreateFailed {
                path: media_dir.to_path_buf(),
                source: e,
            })?;

        let response = self
            .client
            .get_stream(url)
            .await
            .map_err(|e| DownloadError::HttpFailed {
                url: url.to_string(),
                source: e,
            })?;

        if response.status >= 400 {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let ext = media_extension(url, response.content_type.as_deref());
        let stem = filename_stem(&task.title, task.published_at);
        let (output_path, partial, mut file) = create_partial(media_dir, &stem, &ext).await?;
        debug!(path = %output_path.display(), size = ?response.content_length, "Streaming to disk");

        let mut hasher = Sha256::new();
        let mut bytes_downloaded: u64 = 0;
        let mut stream = response.body;

        let streamed: Result<(), DownloadError> = async {
            while let Some(chunk_result) = stream.next().await {
                let chunk = chunk_result.map_err(|e| DownloadError::StreamFailed {
                    url: url.to_string(),
                    source: e,
                })?;

                file.write_all(&chunk)
                    .await
                    .map_err(|e| DownloadError::FileWriteFailed {
                        path: partial.clone(),
                        source: e,
                    })?;

                hasher.update(&chunk);
                bytes_downloaded += chunk.len() as u64;
            }

            file.flush()
                .await
                .map_err(|e| DownloadError::FileWriteFailed {
                    path: partial.clone(),
                    source: e,
                })
        }
        .await;

        drop(file);
        if let Err(e) = streamed {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &output_path)
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: output_path.clone(),
                source: e,
            })?;

        debug!(bytes = bytes_downloaded, "Download finalized");
        Ok(DownloadedMedia {
            path: output_path,
            content_hash: Some(format!("sha256:{:x}", hasher.finalize())),
        })
    }
}

/// Remove `.partial` files left in `dir` by interrupted downloads
pub fn cleanup_partial_files(dir: &Path) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut cleaned = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".partial"));

        if is_partial && path.is_file() && std::fs::remove_file(&path).is_ok() {
            cleaned += 1;
        }
    }
    Ok(cleaned)
}
