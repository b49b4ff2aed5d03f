// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single owner of the download pipeline's mutable state.
//!
//! The queue, the in-progress tasks, the library and the failure log live
//! behind one lock so that moving a link from one collection to another is a
//! single step. A link is in at most one of them at any time, and every path
//! that adds a link (pollers, retries, restored pending work) goes through the
//! same lookup.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::library::Library;
use crate::model::{FailureRecord, LibraryEntry, QueueEntry, Task};
use crate::queue::DownloadQueue;

/// Number of detailed failure records kept for `/failures`.
///
/// Older records are dropped from the view, but their links stay known until
/// the log is cleared.
pub const FAILURE_LOG_CAPACITY: usize = 200;

/// Where a known link currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Queue,
    Tasks,
    Library,
    Failures,
}

/// Aggregate view served by `/state`
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub tasks: Vec<Task>,
    pub queue: Vec<QueueEntry>,
    pub library: Vec<LibraryEntry>,
}

/// Collection sizes, for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub queued: usize,
    pub in_progress: usize,
    pub downloaded: usize,
    pub failed: usize,
}

struct Inner {
    queue: DownloadQueue,
    tasks: Vec<Task>,
    library: Library,
    failures: VecDeque<FailureRecord>,
    failed_links: HashSet<String>,
}

impl Inner {
    fn locate(&self, link: &str) -> Option<Location> {
        if self.queue.contains(link) {
            Some(Location::Queue)
        } else if self.tasks.iter().any(|t| t.link == link) {
            Some(Location::Tasks)
        } else if self.library.contains(link) {
            Some(Location::Library)
        } else if self.failed_links.contains(link) {
            Some(Location::Failures)
        } else {
            None
        }
    }

    fn take_task(&mut self, link: &str) -> Option<Task> {
        let index = self.tasks.iter().position(|t| t.link == link)?;
        Some(self.tasks.remove(index))
    }
}

pub struct Ledger {
    inner: Mutex<Inner>,
    available: Notify,
}

impl Ledger {
    /// Create a ledger with an empty queue around an opened library
    pub fn new(library: Library) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: DownloadQueue::new(),
                tasks: Vec::new(),
                library,
                failures: VecDeque::new(),
                failed_links: HashSet::new(),
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Which collection currently holds `link`, if any
    pub fn locate(&self, link: &str) -> Option<Location> {
        self.lock().locate(link)
    }

    /// Queue `entry` unless its link is already known anywhere.
    ///
    /// The check and the insert happen under the same lock.
    pub fn offer(&self, entry: QueueEntry) -> bool {
        let mut inner = self.lock();
        if let Some(location) = inner.locate(&entry.link) {
            debug!(link = %entry.link, ?location, "Skipping known link");
            return false;
        }
        let added = inner.queue.enqueue(entry);
        drop(inner);
        if added {
            self.available.notify_waiters();
        }
        added
    }

    /// Move the oldest queue entry into Tasks, if there is one
    pub fn try_claim(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut inner = self.lock();
        let task = inner.queue.dequeue()?.into_task(now);
        inner.tasks.push(task.clone());
        Some(task)
    }

    /// Wait until an entry can be claimed, then claim it
    pub async fn claim(&self) -> Task {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_claim(Utc::now()) {
                return task;
            }
            notified.await;
        }
    }

    /// Record a finished download and drop its task.
    ///
    /// If the library cannot be written the task stays in place and the
    /// error is returned.
    pub fn complete(
        &self,
        task: &Task,
        path: PathBuf,
        content_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<LibraryEntry, StoreError> {
        let entry = LibraryEntry {
            title: task.title.clone(),
            link: task.link.clone(),
            downloaded_at: now,
            path,
            content_hash,
        };

        let mut inner = self.lock();
        if !inner.library.add(entry.clone())? {
            warn!(link = %task.link, "Link was already in the library");
        }
        inner.take_task(&task.link);
        Ok(entry)
    }

    /// Mark a task as waiting out a retry backoff
    pub fn schedule_retry(&self, link: &str, retry_at: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        match inner.tasks.iter_mut().find(|t| t.link == link) {
            Some(task) => {
                task.retry_at = Some(retry_at);
                true
            }
            None => false,
        }
    }

    /// Move a task back to the end of the queue, keeping its attempt count
    pub fn requeue(&self, link: &str) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.take_task(link) else {
            return false;
        };
        let added = inner.queue.enqueue(task.into_entry());
        drop(inner);
        if added {
            self.available.notify_waiters();
        }
        added
    }

    /// Drop a task for good and remember why
    pub fn fail(&self, link: &str, error: String, now: DateTime<Utc>) -> Option<FailureRecord> {
        let mut inner = self.lock();
        let task = inner.take_task(link)?;
        let record = FailureRecord {
            title: task.title,
            link: task.link,
            attempts: task.attempt,
            error,
            failed_at: now,
        };
        inner.failed_links.insert(record.link.clone());
        if inner.failures.len() >= FAILURE_LOG_CAPACITY {
            inner.failures.pop_front();
        }
        inner.failures.push_back(record.clone());
        Some(record)
    }

    /// Forget all terminal failures so their links can be queued again
    pub fn clear_failures(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.failed_links.len();
        inner.failures.clear();
        inner.failed_links.clear();
        count
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    pub fn queue(&self) -> Vec<QueueEntry> {
        self.lock().queue.snapshot()
    }

    pub fn library(&self) -> Vec<LibraryEntry> {
        self.lock().library.list().to_vec()
    }

    /// Most recent failures last
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.lock().failures.iter().cloned().collect()
    }

    /// Consistent snapshot of tasks, queue and library
    pub fn state(&self) -> StateView {
        let inner = self.lock();
        StateView {
            tasks: inner.tasks.clone(),
            queue: inner.queue.snapshot(),
            library: inner.library.list().to_vec(),
        }
    }

    pub fn counts(&self) -> Counts {
        let inner = self.lock();
        Counts {
            queued: inner.queue.len(),
            in_progress: inner.tasks.len(),
            downloaded: inner.library.len(),
            failed: inner.failed_links.len(),
        }
    }

    /// Unfinished work to persist on shutdown: in-flight tasks, then the queue.
    ///
    /// An interrupted attempt is not counted against the item; one that is
    /// waiting out a backoff already failed and keeps its count.
    pub fn pending(&self) -> Vec<QueueEntry> {
        let inner = self.lock();
        let in_flight = inner.tasks.iter().cloned().map(|task| {
            let interrupted = task.retry_at.is_none();
            let mut entry = task.into_entry();
            if interrupted {
                entry.attempts = entry.attempts.saturating_sub(1);
            }
            entry
        });
        in_flight.chain(inner.queue.snapshot()).collect()
    }

    /// Put previously pending entries at the head of the queue, in order.
    ///
    /// Entries whose link is already known are skipped. Returns how many were
    /// restored.
    pub fn restore(&self, entries: Vec<QueueEntry>) -> usize {
        let mut inner = self.lock();
        let mut restored = 0;
        for entry in entries.into_iter().rev() {
            if inner.locate(&entry.link).is_some() {
                continue;
            }
            if inner.queue.push_front(entry) {
                restored += 1;
            }
        }
        drop(inner);
        if restored > 0 {
            self.available.notify_waiters();
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceType;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn ledger() -> (TempDir, Ledger) {
        let dir = tempdir().unwrap();
        let library = Library::open(&dir.path().join("library.jsonl")).unwrap();
        (dir, Ledger::new(library))
    }

    fn entry(link: &str) -> QueueEntry {
        QueueEntry {
            title: format!("Title {link}"),
            link: link.to_string(),
            kind: SourceType::Generic,
            published_at: None,
            attempts: 0,
        }
    }

    #[test]
    fn link_moves_through_queue_tasks_library() {
        let (_dir, ledger) = ledger();

        assert!(ledger.offer(entry("a")));
        assert_eq!(ledger.locate("a"), Some(Location::Queue));

        let task = ledger.try_claim(Utc::now()).unwrap();
        assert_eq!(task.attempt, 1);
        assert_eq!(ledger.locate("a"), Some(Location::Tasks));
        assert!(ledger.queue().is_empty());

        ledger
            .complete(&task, PathBuf::from("/media/a.mp3"), None, Utc::now())
            .unwrap();
        assert_eq!(ledger.locate("a"), Some(Location::Library));
        assert!(ledger.tasks().is_empty());
        assert_eq!(ledger.library().len(), 1);
    }

    #[test]
    fn offer_rejects_links_known_anywhere() {
        let (_dir, ledger) = ledger();
        ledger.offer(entry("done"));
        ledger.offer(entry("running"));
        ledger.offer(entry("queued"));

        let done = ledger.try_claim(Utc::now()).unwrap();
        ledger
            .complete(&done, PathBuf::from("/x"), None, Utc::now())
            .unwrap();
        let running = ledger.try_claim(Utc::now()).unwrap();
        assert_eq!(running.link, "running");

        assert!(!ledger.offer(entry("queued")));
        assert!(!ledger.offer(entry("running")));
        assert!(!ledger.offer(entry("done")));
        assert_eq!(ledger.counts().queued, 1);
    }

    #[test]
    fn failed_links_are_blocked_until_cleared() {
        let (_dir, ledger) = ledger();
        ledger.offer(entry("a"));
        let task = ledger.try_claim(Utc::now()).unwrap();

        let record = ledger.fail(&task.link, "boom".to_string(), Utc::now()).unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(ledger.locate("a"), Some(Location::Failures));
        assert!(!ledger.offer(entry("a")));

        assert_eq!(ledger.clear_failures(), 1);
        assert!(ledger.offer(entry("a")));
    }

    #[test]
    fn failure_log_is_bounded() {
        let (_dir, ledger) = ledger();
        for i in 0..FAILURE_LOG_CAPACITY + 5 {
            let link = format!("link-{i}");
            ledger.offer(entry(&link));
            ledger.try_claim(Utc::now()).unwrap();
            ledger.fail(&link, "nope".to_string(), Utc::now());
        }

        let failures = ledger.failures();
        assert_eq!(failures.len(), FAILURE_LOG_CAPACITY);
        assert_eq!(failures[0].link, "link-5");
    }

    #[test]
    fn links_dropped_from_failure_view_stay_blocked() {
        let (_dir, ledger) = ledger();
        for i in 0..=FAILURE_LOG_CAPACITY {
            let link = format!("link-{i}");
            ledger.offer(entry(&link));
            ledger.try_claim(Utc::now()).unwrap();
            ledger.fail(&link, "nope".to_string(), Utc::now());
        }
        assert!(ledger.failures().iter().all(|f| f.link != "link-0"));

        assert_eq!(ledger.locate("link-0"), Some(Location::Failures));
        assert!(!ledger.offer(entry("link-0")));
        assert_eq!(ledger.counts().failed, FAILURE_LOG_CAPACITY + 1);

        assert_eq!(ledger.clear_failures(), FAILURE_LOG_CAPACITY + 1);
        assert!(ledger.offer(entry("link-0")));
    }

    #[test]
    fn requeue_goes_to_the_back_with_attempts() {
        let (_dir, ledger) = ledger();
        ledger.offer(entry("a"));
        ledger.offer(entry("b"));
        let task = ledger.try_claim(Utc::now()).unwrap();

        assert!(ledger.schedule_retry(&task.link, Utc::now()));
        assert_eq!(ledger.locate("a"), Some(Location::Tasks));
        assert!(ledger.requeue(&task.link));

        let queue = ledger.queue();
        assert_eq!(queue[0].link, "b");
        assert_eq!(queue[1].link, "a");
        assert_eq!(queue[1].attempts, 1);
    }

    #[test]
    fn pending_lists_tasks_first_and_uncounts_interrupted_attempts() {
        let (_dir, ledger) = ledger();
        ledger.offer(entry("running"));
        ledger.offer(entry("waiting"));
        ledger.offer(entry("queued"));
        ledger.try_claim(Utc::now()).unwrap();
        let waiting = ledger.try_claim(Utc::now()).unwrap();
        ledger.schedule_retry(&waiting.link, Utc::now());

        let pending = ledger.pending();
        let summary: Vec<_> = pending.iter().map(|e| (e.link.as_str(), e.attempts)).collect();
        assert_eq!(summary, vec![("running", 0), ("waiting", 1), ("queued", 0)]);
    }

    #[test]
    fn restore_puts_entries_in_front_and_skips_known() {
        let (_dir, ledger) = ledger();
        ledger.offer(entry("fresh"));

        let restored = ledger.restore(vec![entry("p1"), entry("fresh"), entry("p2")]);

        assert_eq!(restored, 2);
        let links: Vec<_> = ledger.queue().into_iter().map(|e| e.link).collect();
        assert_eq!(links, vec!["p1", "p2", "fresh"]);
    }

    #[tokio::test]
    async fn claim_waits_for_an_offer() {
        let (_dir, ledger) = ledger();
        let ledger = Arc::new(ledger);

        let waiter = tokio::spawn({
            let ledger = Arc::clone(&ledger);
            async move { ledger.claim().await }
        });
        tokio::task::yield_now().await;
        ledger.offer(entry("late"));

        let task = waiter.await.unwrap();
        assert_eq!(task.link, "late");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_are_exactly_once() {
        let (_dir, ledger) = ledger();
        let ledger = Arc::new(ledger);
        for i in 0..200 {
            ledger.offer(entry(&format!("item-{i}")));
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = ledger.try_claim(Utc::now()) {
                    claimed.push(task.link);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
    }
}
