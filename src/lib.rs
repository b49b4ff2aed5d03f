pub mod api;
pub mod config;
pub mod daemon;
pub mod download;
pub mod error;
pub mod feed;
pub mod filter;
pub mod http;
pub mod ledger;
pub mod library;
pub mod model;
pub mod persist;
pub mod poller;
pub mod progress;
pub mod queue;
pub mod reload;
pub mod sources;
pub mod worker;

// Re-export main types for convenience
pub use config::{Config, ConfigStore};
pub use daemon::{DEFAULT_DRAIN_TIMEOUT, Daemon, DaemonOptions};
pub use download::{Downloader, DownloadedMedia, MediaDownloader, RetryDecision, RetryPolicy};
pub use error::{ConfigError, DaemonError, DownloadError, FeedError, SourceError, StoreError};
pub use feed::{FeedReader, HttpFeedReader};
pub use filter::DownloadFilter;
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use ledger::{Counts, Ledger, Location, StateView};
pub use library::Library;
pub use model::{Candidate, FailureRecord, LibraryEntry, QueueEntry, Source, SourceType, Task};
pub use poller::{PollContext, PollOutcome, Scheduler, poll_once};
pub use progress::{NoopReporter, PipelineEvent, ProgressReporter, SharedProgressReporter, TracingReporter};
pub use sources::SourceRegistry;
pub use worker::{WorkerContext, WorkerPool};
