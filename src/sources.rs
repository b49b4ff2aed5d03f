// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::error::SourceError;
use crate::feed::{FeedReader, is_channel_url};
use crate::model::{Source, SourceType};
use crate::persist;

/// Ordered, persisted list of configured sources.
///
/// Channel-style URLs are resolved to a feed URL before they are stored; a
/// failed resolution leaves the registry untouched. Every change is published
/// on a watch channel so the poll scheduler can follow it.
pub struct SourceRegistry {
    path: PathBuf,
    reader: Arc<dyn FeedReader>,
    tx: watch::Sender<Vec<Source>>,
    write_lock: Mutex<()>,
}

impl SourceRegistry {
    /// Open the registry stored at `path`, creating an empty one if needed
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path, reader: Arc<dyn FeedReader>) -> Result<Self, SourceError> {
        let sources: Vec<Source> = persist::load_or_create(path)?;
        info!(count = sources.len(), "Loaded sources");
        let (tx, _rx) = watch::channel(sources);
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            tx,
            write_lock: Mutex::new(()),
        })
    }

    /// Snapshot of the configured sources in order
    pub fn list(&self) -> Vec<Source> {
        self.tx.borrow().clone()
    }

    /// Receive the source list every time it changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<Source>> {
        self.tx.subscribe()
    }

    /// Add a source, resolving channel URLs first.
    ///
    /// Adding a URL that is already registered returns the stored source and
    /// changes nothing.
    #[instrument(skip(self))]
    pub async fn add(&self, url: &str, kind: SourceType) -> Result<Source, SourceError> {
        let source = self.resolve(Source::new(url.trim(), kind)).await?;
        let mut existing = None;
        self.update(|sources| {
            match sources.iter().find(|s| s.url == source.url) {
                Some(known) => existing = Some(known.clone()),
                None => sources.push(source.clone()),
            }
            Ok(())
        })?;
        if let Some(known) = existing {
            debug!(url = %known.url, "Source already registered");
            return Ok(known);
        }
        info!(url = %source.url, "Source added");
        Ok(source)
    }

    /// Remove the source at `index`.
    ///
    /// Items it already queued or downloaded are left alone.
    #[instrument(skip(self))]
    pub fn remove(&self, index: usize) -> Result<Source, SourceError> {
        let mut removed = None;
        self.update(|sources| {
            if index >= sources.len() {
                return Err(SourceError::IndexOutOfRange {
                    index,
                    len: sources.len(),
                });
            }
            removed = Some(sources.remove(index));
            Ok(())
        })?;
        let removed = removed.ok_or(SourceError::IndexOutOfRange { index, len: 0 })?;
        info!(url = %removed.url, "Source removed");
        Ok(removed)
    }

    /// Replace the whole list, resolving any channel URLs it contains.
    ///
    /// Either every entry resolves and the list is stored, or nothing changes.
    #[instrument(skip_all, fields(count = sources.len()))]
    pub async fn replace(&self, sources: Vec<Source>) -> Result<Vec<Source>, SourceError> {
        let mut resolved = Vec::with_capacity(sources.len());
        for source in sources {
            resolved.push(self.resolve(source).await?);
        }
        self.update(|current| {
            *current = resolved.clone();
            Ok(())
        })?;
        info!(count = resolved.len(), "Sources replaced");
        Ok(resolved)
    }

    /// Re-read the file after it was edited by hand.
    ///
    /// Channel URLs in the file are resolved like in [`replace`](Self::replace)
    /// and the resolved list is written back. If the file cannot be read or
    /// an entry does not resolve, the current list stays in effect. Returns
    /// whether the list changed.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn reload(&self) -> Result<bool, SourceError> {
        let stored: Vec<Source> = persist::load(&self.path)?;
        let mut resolved = Vec::with_capacity(stored.len());
        for source in stored.iter().cloned() {
            resolved.push(self.resolve(source).await?);
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if *self.tx.borrow() == resolved {
            return Ok(false);
        }
        if resolved != stored {
            persist::save(&resolved, &self.path)?;
        }
        info!(count = resolved.len(), "Sources reloaded from disk");
        self.tx.send_replace(resolved);
        Ok(true)
    }

    async fn resolve(&self, source: Source) -> Result<Source, SourceError> {
        if source.url.is_empty() {
            return Err(SourceError::Unresolvable {
                url: source.url,
                reason: "empty URL".to_string(),
            });
        }
        if !is_channel_url(&source.url) {
            return Ok(source);
        }

        let url = self.reader.resolve(&source.url).await?;
        let kind = match source.kind {
            SourceType::Generic => SourceType::YoutubeChannel,
            other => other,
        };
        info!(channel = %source.url, feed = %url, "Resolved channel feed");
        Ok(Source { url, kind })
    }

    /// Apply `change` to a copy of the list, persist it, then publish it
    fn update<F>(&self, change: F) -> Result<(), SourceError>
    where
        F: FnOnce(&mut Vec<Source>) -> Result<(), SourceError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut sources = self.tx.borrow().clone();
        change(&mut sources)?;
        persist::save(&sources, &self.path)?;
        self.tx.send_replace(sources);
        Ok(())
    }
}
