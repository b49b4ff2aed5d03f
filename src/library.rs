// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::error::StoreError;
use crate::model::LibraryEntry;

/// Durable catalog of completed downloads.
///
/// Stored as JSON Lines, one entry per line. Adding an entry appends a single
/// line, so the cost of a write does not grow with the library. An entry is
/// never replaced, and adding a link that is already present is a no-op.
#[derive(Debug)]
pub struct Library {
    path: PathBuf,
    entries: Vec<LibraryEntry>,
    links: HashSet<String>,
}

fn write_failed(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source,
    }
}

fn open_for_append(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(write_failed(path))
}

/// Parsed entries plus the byte length of the intact prefix.
///
/// Only the last line may be broken: that is an append cut short by a crash.
/// A broken line anywhere else is corruption.
fn parse_lines(path: &Path, content: &str) -> Result<(Vec<LibraryEntry>, usize), StoreError> {
    let mut entries = Vec::new();
    let mut intact = 0;

    for (index, chunk) in content.split_inclusive('\n').enumerate() {
        let terminated = chunk.ends_with('\n');
        let line = chunk.trim();
        if !line.is_empty() {
            match serde_json::from_str::<LibraryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(_) if !terminated => break,
                Err(e) => {
                    return Err(StoreError::Parse {
                        path: path.to_path_buf(),
                        reason: format!("line {}: {e}", index + 1),
                    });
                }
            }
        }
        intact += chunk.len();
    }
    Ok((entries, intact))
}

impl Library {
    /// Open the library at `path`, creating an empty one if needed.
    ///
    /// A trailing line left behind by an interrupted append is dropped.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(write_failed(parent))?;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let (entries, intact) = parse_lines(path, &content)?;
        let mut file = open_for_append(path)?;
        if intact < content.len() {
            warn!(
                dropped_bytes = content.len() - intact,
                "Dropping incomplete last library line"
            );
            file.set_len(intact as u64).map_err(write_failed(path))?;
        } else if !content.is_empty() && !content.ends_with('\n') {
            file.write_all(b"\n").map_err(write_failed(path))?;
        }

        let mut links = HashSet::with_capacity(entries.len());
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|e| links.insert(e.link.clone()))
            .collect();
        info!(count = entries.len(), "Loaded library");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            links,
        })
    }

    /// Whether `link` has already been downloaded
    pub fn contains(&self, link: &str) -> bool {
        self.links.contains(link)
    }

    /// Append `entry` and persist.
    ///
    /// Returns `false` if the link was already in the library. If writing
    /// fails the entry is not kept in memory either, and whatever part of the
    /// line reached the file is cut off again.
    pub fn add(&mut self, entry: LibraryEntry) -> Result<bool, StoreError> {
        if self.links.contains(&entry.link) {
            return Ok(false);
        }

        let mut line = serde_json::to_string(&entry).map_err(|e| StoreError::Serialize {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut file = open_for_append(&self.path)?;
        let len = file.metadata().map_err(write_failed(&self.path))?.len();
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.sync_data()) {
            if let Err(truncate) = file.set_len(len) {
                warn!(path = %self.path.display(), error = %truncate, "Failed to cut off partial library line");
            }
            return Err(write_failed(&self.path)(e));
        }

        self.links.insert(entry.link.clone());
        self.entries.push(entry);
        Ok(true)
    }

    /// All entries in the order they were added
    pub fn list(&self) -> &[LibraryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
