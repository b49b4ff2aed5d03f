// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process wiring: opens the stores, runs pollers, workers and the API, and
//! persists unfinished work on the way out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::api::{self, AppState};
use crate::config::ConfigStore;
use crate::download::{Downloader, HttpDownloader, MediaDownloader, YtDlpDownloader, cleanup_partial_files};
use crate::error::DaemonError;
use crate::feed::{FeedReader, HttpFeedReader};
use crate::http::ReqwestClient;
use crate::ledger::Ledger;
use crate::library::Library;
use crate::model::QueueEntry;
use crate::persist;
use crate::poller::{PollContext, Scheduler};
use crate::progress::{PipelineEvent, SharedProgressReporter, TracingReporter};
use crate::reload::{WatchedFiles, spawn_reloader};
use crate::sources::SourceRegistry;
use crate::worker::{WorkerContext, WorkerPool};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const CONFIG_FILE: &str = "config.yaml";
const SOURCES_FILE: &str = "sources.yaml";
const LIBRARY_FILE: &str = "library.jsonl";
const PENDING_FILE: &str = "pending.json";

/// Where the daemon keeps its files and how long it waits on shutdown
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Holds `config.yaml` and `sources.yaml`
    pub config_dir: PathBuf,
    /// Holds `library.jsonl` and `pending.json`
    pub data_dir: PathBuf,
    /// How long in-flight downloads may run after shutdown is requested
    pub drain_timeout: Duration,
}

/// The opened stores plus the collaborators that talk to the network
pub struct Daemon {
    options: DaemonOptions,
    config: Arc<ConfigStore>,
    sources: Arc<SourceRegistry>,
    ledger: Arc<Ledger>,
    reader: Arc<dyn FeedReader>,
    downloader: Arc<dyn Downloader>,
    reporter: SharedProgressReporter,
}

fn create_dir(path: &Path) -> Result<(), DaemonError> {
    std::fs::create_dir_all(path).map_err(|e| DaemonError::CreateDirectoryFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

impl Daemon {
    /// Open every store with the default network collaborators
    pub fn open(options: DaemonOptions) -> Result<Self, DaemonError> {
        let client = ReqwestClient::new();
        let reader: Arc<dyn FeedReader> = Arc::new(HttpFeedReader::new(client.clone()));
        let downloader: Arc<dyn Downloader> = Arc::new(MediaDownloader::new(
            HttpDownloader::new(client),
            YtDlpDownloader::new(),
        ));
        Self::open_with(options, reader, downloader, TracingReporter::shared())
    }

    /// Open every store, restore pending work and clean up interrupted downloads
    #[instrument(skip_all, fields(config_dir = %options.config_dir.display(), data_dir = %options.data_dir.display()))]
    pub fn open_with(
        options: DaemonOptions,
        reader: Arc<dyn FeedReader>,
        downloader: Arc<dyn Downloader>,
        reporter: SharedProgressReporter,
    ) -> Result<Self, DaemonError> {
        create_dir(&options.config_dir)?;
        create_dir(&options.data_dir)?;

        let config = ConfigStore::open(&options.config_dir.join(CONFIG_FILE))?;
        let sources = SourceRegistry::open(&options.config_dir.join(SOURCES_FILE), Arc::clone(&reader))?;
        let library = Library::open(&options.data_dir.join(LIBRARY_FILE))?;
        info!(entries = library.len(), "Loaded library");

        let daemon = Self {
            options,
            config: Arc::new(config),
            sources: Arc::new(sources),
            ledger: Arc::new(Ledger::new(library)),
            reader,
            downloader,
            reporter,
        };
        daemon.restore_pending()?;
        daemon.cleanup_partials();
        Ok(daemon)
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    fn pending_path(&self) -> PathBuf {
        self.options.data_dir.join(PENDING_FILE)
    }

    /// Move entries saved by the last shutdown back to the head of the queue
    fn restore_pending(&self) -> Result<usize, DaemonError> {
        let path = self.pending_path();
        if !path.exists() {
            return Ok(0);
        }

        let entries: Vec<QueueEntry> = persist::load(&path)?;
        let total = entries.len();
        let restored = self.ledger.restore(entries);
        info!(restored, skipped = total - restored, "Restored pending downloads");

        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove pending file");
        }
        Ok(restored)
    }

    fn cleanup_partials(&self) {
        let media_dir = self.config.load().media_dir;
        match cleanup_partial_files(&media_dir) {
            Ok(0) => {}
            Ok(count) => self
                .reporter
                .report(PipelineEvent::PartialFilesCleanedUp { count }),
            Err(e) => warn!(media_dir = %media_dir.display(), error = %e, "Failed to clean up partial files"),
        }
    }

    /// Write whatever is still queued or in flight to `pending.json`
    pub fn persist_pending(&self) -> Result<usize, DaemonError> {
        let pending = self.ledger.pending();
        if pending.is_empty() {
            return Ok(0);
        }
        persist::save(&pending, &self.pending_path())?;
        info!(count = pending.len(), "Persisted pending downloads");
        Ok(pending.len())
    }

    /// Handles for the API router
    pub fn app_state(&self) -> AppState {
        AppState {
            ledger: Arc::clone(&self.ledger),
            sources: Arc::clone(&self.sources),
            config: Arc::clone(&self.config),
            reader: Arc::clone(&self.reader),
            started: Instant::now(),
        }
    }

    /// Serve until `shutdown` is cancelled, then drain workers and persist
    /// unfinished work.
    ///
    /// Hand edits to the files in the config directory are picked up while
    /// running. The listen address is read once; changing it takes effect on
    /// restart.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let scheduler = Scheduler::new(PollContext {
            reader: Arc::clone(&self.reader),
            ledger: Arc::clone(&self.ledger),
            config: self.config.subscribe(),
            reporter: Arc::clone(&self.reporter),
        });
        let scheduler = tokio::spawn(scheduler.run(self.sources.subscribe(), shutdown.clone()));

        let pool = WorkerPool::new(WorkerContext {
            ledger: Arc::clone(&self.ledger),
            downloader: Arc::clone(&self.downloader),
            config: self.config.subscribe(),
            reporter: Arc::clone(&self.reporter),
            shutdown: shutdown.clone(),
        });
        let pool = tokio::spawn(pool.run(
            self.config.subscribe(),
            shutdown.clone(),
            self.options.drain_timeout,
        ));

        let reloader = match spawn_reloader(
            WatchedFiles {
                dir: self.options.config_dir.clone(),
                config: CONFIG_FILE.to_string(),
                sources: SOURCES_FILE.to_string(),
            },
            Arc::clone(&self.config),
            Arc::clone(&self.sources),
            shutdown.clone(),
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to watch config directory, hand edits need a restart");
                None
            }
        };

        let served = self.serve(shutdown.clone()).await;
        shutdown.cancel();

        if let Some(reloader) = reloader
            && let Err(e) = reloader.await
        {
            error!(error = %e, "Config watcher task failed");
        }

        if let Err(e) = scheduler.await {
            error!(error = %e, "Scheduler task failed");
        }
        if let Err(e) = pool.await {
            error!(error = %e, "Worker pool task failed");
        }
        self.persist_pending()?;
        info!("Shutdown complete");
        served
    }

    async fn serve(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let addr = self.config.load().bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Bind {
                addr: addr.clone(),
                source: e,
            })?;
        info!(%addr, "API listening");

        axum::serve(listener, api::router(self.app_state()))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(DaemonError::Serve)
    }
}
