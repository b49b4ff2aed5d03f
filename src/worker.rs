// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Download workers and the pool that keeps `parallel_downloads` of them alive.
//!
//! A worker only checks its cancellation token while it waits for work, so a
//! download that has started always runs to completion. Shrinking the pool
//! retires the highest-numbered workers; their slots are not reused until
//! they have finished.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::download::{Downloader, RetryDecision};
use crate::error::DownloadError;
use crate::ledger::Ledger;
use crate::model::Task;
use crate::progress::{PipelineEvent, SharedProgressReporter};

/// Shared handles every worker uses
#[derive(Clone)]
pub struct WorkerContext {
    pub ledger: Arc<Ledger>,
    pub downloader: Arc<dyn Downloader>,
    pub config: watch::Receiver<Config>,
    pub reporter: SharedProgressReporter,
    /// Cancels pending retry timers; their tasks stay in place for persistence
    pub shutdown: CancellationToken,
}

/// Claim and process tasks until `token` is cancelled
pub async fn run_worker(id: usize, ctx: WorkerContext, token: CancellationToken) -> usize {
    debug!(worker_id = id, "Worker started");
    loop {
        let task = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            task = ctx.ledger.claim() => task,
        };
        process_task(id, &ctx, task).await;
    }
    debug!(worker_id = id, "Worker stopped");
    id
}

/// Download one claimed task and settle it in the ledger
pub async fn process_task(worker_id: usize, ctx: &WorkerContext, task: Task) {
    let config = ctx.config.borrow().clone();
    ctx.reporter.report(PipelineEvent::TaskStarted {
        worker_id,
        title: task.title.clone(),
        link: task.link.clone(),
        attempt: task.attempt,
    });

    let result = match ctx.downloader.fetch(&task, &config.media_dir).await {
        Ok(media) => ctx
            .ledger
            .complete(&task, media.path, media.content_hash, Utc::now())
            .map_err(|e| DownloadError::Library {
                url: task.link.clone(),
                source: e,
            }),
        Err(e) => Err(e),
    };

    match result {
        Ok(entry) => ctx.reporter.report(PipelineEvent::Downloaded {
            worker_id,
            title: entry.title,
            link: entry.link,
            path: entry.path.display().to_string(),
            content_hash: entry.content_hash,
        }),
        Err(e) => handle_failure(worker_id, ctx, &config, &task, e),
    }
}

fn handle_failure(
    worker_id: usize,
    ctx: &WorkerContext,
    config: &Config,
    task: &Task,
    error: DownloadError,
) {
    match config.retry.decide(&error, task.attempt) {
        RetryDecision::Retry { delay } => {
            let retry_at = Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
            ctx.ledger.schedule_retry(&task.link, retry_at);
            ctx.reporter.report(PipelineEvent::RetryScheduled {
                worker_id,
                title: task.title.clone(),
                link: task.link.clone(),
                attempt: task.attempt,
                delay,
                error: error.to_string(),
            });
            schedule_requeue(ctx, task.link.clone(), delay);
        }
        RetryDecision::GiveUp { reason } => {
            let message = format!("{error} ({reason})");
            ctx.ledger.fail(&task.link, message.clone(), Utc::now());
            ctx.reporter.report(PipelineEvent::DownloadFailed {
                worker_id,
                title: task.title.clone(),
                link: task.link.clone(),
                attempts: task.attempt,
                error: message,
            });
        }
    }
}

fn schedule_requeue(ctx: &WorkerContext, link: String, delay: Duration) {
    if delay.is_zero() {
        ctx.ledger.requeue(&link);
        return;
    }

    let ledger = Arc::clone(&ctx.ledger);
    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                ledger.requeue(&link);
            }
        }
    });
}

/// Supervises the download workers and resizes them on config changes
pub struct WorkerPool {
    ctx: WorkerContext,
    target: usize,
    active: BTreeMap<usize, CancellationToken>,
    retiring: BTreeSet<usize>,
    task_ids: HashMap<Id, usize>,
    workers: JoinSet<usize>,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext) -> Self {
        let target = ctx.config.borrow().parallel_downloads;
        Self {
            ctx,
            target,
            active: BTreeMap::new(),
            retiring: BTreeSet::new(),
            task_ids: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    /// Workers that may still claim new tasks
    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Workers finishing their last task before exiting
    pub fn retiring(&self) -> usize {
        self.retiring.len()
    }

    /// Change the number of workers
    pub fn resize(&mut self, target: usize) {
        if target != self.target {
            info!(from = self.target, to = target, "Resizing worker pool");
        }
        self.target = target;
        self.rebalance();
    }

    fn rebalance(&mut self) {
        while self.active.len() > self.target {
            let Some((id, token)) = self.active.pop_last() else {
                break;
            };
            debug!(worker_id = id, "Retiring worker");
            token.cancel();
            self.retiring.insert(id);
        }

        while self.active.len() + self.retiring.len() < self.target {
            let id = (0..)
                .find(|id| !self.active.contains_key(id) && !self.retiring.contains(id))
                .unwrap_or(self.active.len() + self.retiring.len());
            let token = CancellationToken::new();
            let handle = self
                .workers
                .spawn(run_worker(id, self.ctx.clone(), token.clone()));
            self.task_ids.insert(handle.id(), id);
            self.active.insert(id, token);
        }
    }

    fn reap(&mut self, task_id: Id) {
        if let Some(id) = self.task_ids.remove(&task_id) {
            self.retiring.remove(&id);
            if self.active.remove(&id).is_some() {
                warn!(worker_id = id, "Worker exited unexpectedly");
            }
        }
    }

    /// Run until `shutdown` fires, then drain.
    ///
    /// Draining lets workers finish what they are downloading for up to
    /// `drain_timeout`; anything still running after that is aborted and left
    /// in the ledger.
    pub async fn run(
        mut self,
        mut config: watch::Receiver<Config>,
        shutdown: CancellationToken,
        drain_timeout: Duration,
    ) {
        let initial = config.borrow_and_update().parallel_downloads;
        self.resize(initial);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let target = config.borrow_and_update().parallel_downloads;
                    self.resize(target);
                }
                Some(joined) = self.workers.join_next_with_id() => {
                    match joined {
                        Ok((task_id, _)) => self.reap(task_id),
                        Err(e) => {
                            error!(error = %e, "Worker panicked");
                            self.reap(e.id());
                        }
                    }
                    self.rebalance();
                }
            }
        }

        self.drain(drain_timeout).await;
    }

    async fn drain(&mut self, timeout: Duration) {
        for token in self.active.values() {
            token.cancel();
        }
        let busy = self.active.len() + self.retiring.len();
        info!(workers = busy, timeout_secs = timeout.as_secs(), "Draining workers");

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.workers.len(),
                "Drain timeout reached, aborting in-flight downloads"
            );
            self.workers.shutdown().await;
        }
        self.active.clear();
        self.retiring.clear();
        self.task_ids.clear();
    }
}
