// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{HashSet, VecDeque};

use crate::model::QueueEntry;

/// Pending downloads in arrival order, deduplicated by link.
///
/// Not synchronized on its own; the [`Ledger`](crate::ledger::Ledger) owns the
/// only instance and serializes access.
#[derive(Debug, Default)]
pub struct DownloadQueue {
    entries: VecDeque<QueueEntry>,
    links: HashSet<String>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry`; returns `false` and does nothing if its link is queued
    pub fn enqueue(&mut self, entry: QueueEntry) -> bool {
        if !self.links.insert(entry.link.clone()) {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    /// Put `entry` at the head of the queue, used when restoring pending work
    pub fn push_front(&mut self, entry: QueueEntry) -> bool {
        if !self.links.insert(entry.link.clone()) {
            return false;
        }
        self.entries.push_front(entry);
        true
    }

    /// Remove and return the oldest entry
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front()?;
        self.links.remove(&entry.link);
        Some(entry)
    }

    pub fn contains(&self, link: &str) -> bool {
        self.links.contains(link)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the entries in service order
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }
}
