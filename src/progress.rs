use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Events emitted by pollers and workers as items move through the pipeline
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A source's feed was fetched and parsed
    FeedFetched {
        source: String,
        candidates: usize,
        enqueued: usize,
    },

    /// A source's feed could not be fetched or parsed; retried at the next tick
    FeedFailed { source: String, error: String },

    /// An accepted candidate entered the queue
    Enqueued { title: String, link: String },

    /// A worker claimed an entry
    TaskStarted {
        /// Worker slot that picked up the task
        worker_id: usize,
        title: String,
        link: String,
        attempt: u32,
    },

    /// A download finished and is now in the library
    Downloaded {
        worker_id: usize,
        title: String,
        link: String,
        path: String,
        content_hash: Option<String>,
    },

    /// A download failed and will be queued again after `delay`
    RetryScheduled {
        worker_id: usize,
        title: String,
        link: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },

    /// A download failed for good
    DownloadFailed {
        worker_id: usize,
        title: String,
        link: String,
        attempts: u32,
        error: String,
    },

    /// Leftover partial downloads were removed at startup
    PartialFilesCleanedUp { count: usize },
}

/// Receives pipeline events.
///
/// Implementations can log, collect statistics, or forward events elsewhere.
pub trait ProgressReporter: Send + Sync {
    /// Report a pipeline event
    fn report(&self, event: PipelineEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: PipelineEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Turns every event into a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl TracingReporter {
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

impl ProgressReporter for TracingReporter {
    fn report(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::FeedFetched {
                source,
                candidates,
                enqueued,
            } => {
                if enqueued > 0 {
                    info!(%source, candidates, enqueued, "Feed polled");
                } else {
                    debug!(%source, candidates, "Feed polled, nothing new");
                }
            }
            PipelineEvent::FeedFailed { source, error } => {
                warn!(%source, %error, "Feed poll failed");
            }
            PipelineEvent::Enqueued { title, link } => {
                debug!(%title, %link, "Enqueued");
            }
            PipelineEvent::TaskStarted {
                worker_id,
                title,
                link,
                attempt,
            } => {
                info!(worker_id, %title, %link, attempt, "Download started");
            }
            PipelineEvent::Downloaded {
                worker_id,
                title,
                path,
                content_hash,
                ..
            } => {
                info!(worker_id, %title, %path, hash = content_hash.as_deref().unwrap_or("-"), "Downloaded");
            }
            PipelineEvent::RetryScheduled {
                worker_id,
                title,
                attempt,
                delay,
                error,
                ..
            } => {
                warn!(worker_id, %title, attempt, delay_secs = delay.as_secs(), %error, "Download failed, retry scheduled");
            }
            PipelineEvent::DownloadFailed {
                worker_id,
                title,
                link,
                attempts,
                error,
            } => {
                warn!(worker_id, %title, %link, attempts, %error, "Download failed permanently");
            }
            PipelineEvent::PartialFilesCleanedUp { count } => {
                info!(count, "Removed leftover partial downloads");
            }
        }
    }
}
