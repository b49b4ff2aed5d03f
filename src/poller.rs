// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-source polling.
//!
//! Each distinct source gets its own loop that polls right away and then
//! every `sync_interval`. The [`Scheduler`] follows the source list and starts
//! or cancels loops as sources come and go.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::error::FeedError;
use crate::feed::FeedReader;
use crate::filter::{self, DownloadFilter};
use crate::ledger::Ledger;
use crate::model::{QueueEntry, Source};
use crate::progress::{PipelineEvent, SharedProgressReporter};

/// What a single poll of one source produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub candidates: usize,
    pub known: usize,
    pub rejected: usize,
    pub enqueued: usize,
}

/// Everything a poll loop needs besides its source
#[derive(Clone)]
pub struct PollContext {
    pub reader: Arc<dyn FeedReader>,
    pub ledger: Arc<Ledger>,
    pub config: watch::Receiver<Config>,
    pub reporter: SharedProgressReporter,
}

/// Fetch `source` once and queue every new candidate the filter accepts.
///
/// Candidates are offered in feed order.
pub async fn poll_once(
    reader: &dyn FeedReader,
    ledger: &Ledger,
    source: &Source,
    download_filter: Option<&DownloadFilter>,
    now: DateTime<Utc>,
    reporter: &SharedProgressReporter,
) -> Result<PollOutcome, FeedError> {
    let candidates = reader.read(source).await?;
    let mut outcome = PollOutcome {
        candidates: candidates.len(),
        ..Default::default()
    };

    for candidate in candidates {
        if ledger.locate(&candidate.link).is_some() {
            outcome.known += 1;
            continue;
        }
        if !filter::accept(&candidate, download_filter, now) {
            debug!(link = %candidate.link, "Rejected by download filter");
            outcome.rejected += 1;
            continue;
        }

        let entry = QueueEntry::from_candidate(candidate, source.kind);
        let (title, link) = (entry.title.clone(), entry.link.clone());
        if ledger.offer(entry) {
            outcome.enqueued += 1;
            reporter.report(PipelineEvent::Enqueued { title, link });
        } else {
            outcome.known += 1;
        }
    }

    Ok(outcome)
}

/// Poll `source` until `token` is cancelled.
///
/// The interval is read from the current config after every poll, so a new
/// `sync_interval` applies from the next wake on. Fetch errors are reported
/// and the loop carries on.
#[instrument(skip_all, fields(source = %source.url))]
pub async fn run_poller(ctx: PollContext, source: Source, token: CancellationToken) {
    debug!("Poller started");
    loop {
        let config = ctx.config.borrow().clone();
        let poll = poll_once(
            ctx.reader.as_ref(),
            &ctx.ledger,
            &source,
            config.download_filter.as_ref(),
            Utc::now(),
            &ctx.reporter,
        );

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = poll => result,
        };

        match result {
            Ok(outcome) => ctx.reporter.report(PipelineEvent::FeedFetched {
                source: source.url.clone(),
                candidates: outcome.candidates,
                enqueued: outcome.enqueued,
            }),
            Err(e) => ctx.reporter.report(PipelineEvent::FeedFailed {
                source: source.url.clone(),
                error: e.to_string(),
            }),
        }

        let interval = ctx.config.borrow().sync_interval;
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Poller stopped");
}

/// Keeps exactly one poll loop running per distinct configured source
pub struct Scheduler {
    ctx: PollContext,
    running: HashMap<Source, CancellationToken>,
    pollers: JoinSet<()>,
}

impl Scheduler {
    pub fn new(ctx: PollContext) -> Self {
        Self {
            ctx,
            running: HashMap::new(),
            pollers: JoinSet::new(),
        }
    }

    /// Number of poll loops currently running
    pub fn active(&self) -> usize {
        self.running.len()
    }

    /// Start loops for new sources and cancel loops for removed ones
    pub fn sync(&mut self, sources: &[Source]) {
        let wanted: HashSet<&Source> = sources.iter().collect();

        self.running.retain(|source, token| {
            let keep = wanted.contains(source);
            if !keep {
                info!(source = %source.url, "Stopping poller");
                token.cancel();
            }
            keep
        });

        for source in sources {
            if self.running.contains_key(source) {
                continue;
            }
            info!(source = %source.url, "Starting poller");
            let token = CancellationToken::new();
            self.running.insert(source.clone(), token.clone());
            self.pollers
                .spawn(run_poller(self.ctx.clone(), source.clone(), token));
        }
    }

    /// Follow `sources` until `shutdown` fires, then stop every loop
    pub async fn run(mut self, mut sources: watch::Receiver<Vec<Source>>, shutdown: CancellationToken) {
        let initial = sources.borrow_and_update().clone();
        self.sync(&initial);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = sources.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let list = sources.borrow_and_update().clone();
                    self.sync(&list);
                }
                Some(_) = self.pollers.join_next() => {}
            }
        }

        self.stop().await;
    }

    async fn stop(&mut self) {
        for token in self.running.values() {
            token.cancel();
        }
        self.running.clear();
        while self.pollers.join_next().await.is_some() {}
        debug!("All pollers stopped");
    }
}
