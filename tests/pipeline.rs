//! End-to-end pipeline tests: sources are polled, filtered, queued and
//! downloaded by the worker pool, using mock feed and download collaborators.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tempfile::{TempDir, tempdir};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use drainpipe::filter::{self, DownloadFilter};
use drainpipe::{
    Candidate, Config, ConfigStore, DownloadError, DownloadedMedia, Downloader, FeedError,
    FeedReader, Ledger, Library, Location, NoopReporter, PollContext, QueueEntry, RetryPolicy,
    Scheduler, Source, SourceError, SourceRegistry, SourceType, Task, WorkerContext, WorkerPool,
    poll_once,
};

const FEED_URL: &str = "https://example.com/feed";

#[derive(Default)]
struct MockFeedReader {
    feeds: Mutex<HashMap<String, Vec<Candidate>>>,
    polls: Mutex<HashMap<String, usize>>,
}

impl MockFeedReader {
    fn with_feed(self, url: &str, candidates: Vec<Candidate>) -> Self {
        self.feeds.lock().unwrap().insert(url.to_string(), candidates);
        self
    }

    fn polls(&self, url: &str) -> usize {
        self.polls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FeedReader for MockFeedReader {
    async fn read(&self, source: &Source) -> Result<Vec<Candidate>, FeedError> {
        *self.polls.lock().unwrap().entry(source.url.clone()).or_default() += 1;
        self.feeds
            .lock()
            .unwrap()
            .get(&source.url)
            .cloned()
            .ok_or_else(|| FeedError::HttpStatus {
                url: source.url.clone(),
                status: 404,
            })
    }

    async fn resolve(&self, url: &str) -> Result<String, SourceError> {
        Err(SourceError::Unresolvable {
            url: url.to_string(),
            reason: "not a channel".to_string(),
        })
    }
}

/// Records every fetch; optionally fails or waits for a release signal first
#[derive(Default)]
struct MockDownloader {
    fail_status: Option<u16>,
    gate: Option<Arc<Notify>>,
    fetched: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn fetch(&self, task: &Task, media_dir: &Path) -> Result<DownloadedMedia, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(status) = self.fail_status {
            return Err(DownloadError::HttpStatus {
                url: task.link.clone(),
                status,
            });
        }
        self.fetched.lock().unwrap().push(task.link.clone());
        Ok(DownloadedMedia {
            path: media_dir.join(format!("{}.mp3", task.title)),
            content_hash: None,
        })
    }
}

fn candidate(title: &str, link: &str, age: TimeDelta) -> Candidate {
    Candidate {
        title: title.to_string(),
        link: link.to_string(),
        published_at: Some(Utc::now() - age),
    }
}

fn entry(link: &str) -> QueueEntry {
    QueueEntry {
        title: link.rsplit('/').next().unwrap_or(link).to_string(),
        link: link.to_string(),
        kind: SourceType::Generic,
        published_at: None,
        attempts: 0,
    }
}

fn ledger(dir: &TempDir) -> Arc<Ledger> {
    let library = Library::open(&dir.path().join("library.jsonl")).unwrap();
    Arc::new(Ledger::new(library))
}

fn config(dir: &TempDir, parallel_downloads: usize) -> Config {
    Config {
        sync_interval: Duration::from_secs(1),
        parallel_downloads,
        media_dir: dir.path().join("media"),
        retry: RetryPolicy::immediate(3),
        ..Config::default()
    }
}

fn start_pool(
    ledger: &Arc<Ledger>,
    downloader: Arc<MockDownloader>,
    config: watch::Receiver<Config>,
    shutdown: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let pool = WorkerPool::new(WorkerContext {
        ledger: Arc::clone(ledger),
        downloader,
        config: config.clone(),
        reporter: NoopReporter::shared(),
        shutdown: shutdown.clone(),
    });
    tokio::spawn(pool.run(config, shutdown.clone(), Duration::from_secs(5)))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn item_moves_from_queue_through_tasks_into_library() {
    let dir = tempdir().unwrap();
    let ledger = ledger(&dir);
    let reader = Arc::new(MockFeedReader::default().with_feed(
        FEED_URL,
        vec![candidate("Ep1", "https://example.com/1", TimeDelta::hours(1))],
    ));
    let registry = SourceRegistry::open(&dir.path().join("sources.yaml"), reader.clone()).unwrap();
    registry.add(FEED_URL, SourceType::Generic).await.unwrap();

    let (_config_tx, config_rx) = watch::channel(config(&dir, 1));
    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(PollContext {
        reader: reader.clone(),
        ledger: Arc::clone(&ledger),
        config: config_rx.clone(),
        reporter: NoopReporter::shared(),
    });
    let polling = tokio::spawn(scheduler.run(registry.subscribe(), shutdown.clone()));

    let link = "https://example.com/1";
    wait_until(|| ledger.locate(link) == Some(Location::Queue)).await;

    let gate = Arc::new(Notify::new());
    let downloader = Arc::new(MockDownloader {
        gate: Some(Arc::clone(&gate)),
        ..Default::default()
    });
    let pool = start_pool(&ledger, Arc::clone(&downloader), config_rx, &shutdown);

    wait_until(|| ledger.locate(link) == Some(Location::Tasks)).await;
    assert!(ledger.queue().is_empty());
    assert_eq!(ledger.tasks()[0].attempt, 1);

    gate.notify_one();
    wait_until(|| ledger.locate(link) == Some(Location::Library)).await;

    // later polls see the item in the library and leave it alone
    wait_until(|| reader.polls(FEED_URL) >= 2).await;
    assert!(ledger.queue().is_empty());
    assert!(ledger.tasks().is_empty());
    assert_eq!(ledger.library().len(), 1);
    assert_eq!(ledger.library()[0].title, "Ep1");
    assert_eq!(*downloader.fetched.lock().unwrap(), vec![link.to_string()]);

    shutdown.cancel();
    polling.await.unwrap();
    pool.await.unwrap();
}

#[tokio::test]
async fn items_older_than_max_age_are_never_enqueued() {
    let dir = tempdir().unwrap();
    let ledger = ledger(&dir);
    let reader = MockFeedReader::default().with_feed(
        FEED_URL,
        vec![
            candidate("Old", "https://example.com/old", TimeDelta::hours(48)),
            candidate("New", "https://example.com/new", TimeDelta::hours(2)),
        ],
    );
    let filter = DownloadFilter {
        max_age: Some(TimeDelta::hours(24)),
        ..Default::default()
    };
    let source = Source::new(FEED_URL, SourceType::Generic);

    for _ in 0..3 {
        poll_once(&reader, &ledger, &source, Some(&filter), Utc::now(), &NoopReporter::shared())
            .await
            .unwrap();
    }

    assert_eq!(ledger.locate("https://example.com/old"), None);
    assert_eq!(ledger.locate("https://example.com/new"), Some(Location::Queue));
    assert_eq!(ledger.queue().len(), 1);
}

#[tokio::test]
async fn always_failing_download_stops_after_max_attempts() {
    let dir = tempdir().unwrap();
    let ledger = ledger(&dir);
    let link = "https://example.com/broken";
    ledger.offer(entry(link));

    let downloader = Arc::new(MockDownloader {
        fail_status: Some(503),
        ..Default::default()
    });
    let (_config_tx, config_rx) = watch::channel(config(&dir, 2));
    let shutdown = CancellationToken::new();
    let pool = start_pool(&ledger, Arc::clone(&downloader), config_rx, &shutdown);

    wait_until(|| !ledger.failures().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(downloader.calls.load(Ordering::SeqCst), 3);
    assert_eq!(ledger.failures()[0].attempts, 3);
    assert_eq!(ledger.locate(link), Some(Location::Failures));
    assert!(ledger.queue().is_empty());
    assert!(ledger.tasks().is_empty());
    assert!(ledger.library().is_empty());

    shutdown.cancel();
    pool.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pollers_and_workers_download_each_link_once() {
    let dir = tempdir().unwrap();
    let ledger = ledger(&dir);
    let links: Vec<String> = (0..200).map(|i| format!("https://example.com/{i}")).collect();

    let downloader = Arc::new(MockDownloader::default());
    let (_config_tx, config_rx) = watch::channel(config(&dir, 8));
    let shutdown = CancellationToken::new();
    let pool = start_pool(&ledger, Arc::clone(&downloader), config_rx, &shutdown);

    // two producers offer the same links while the workers drain
    let producers: Vec<_> = (0..2)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let links = links.clone();
            tokio::spawn(async move {
                for link in links {
                    ledger.offer(entry(&link));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    wait_until(|| ledger.library().len() == links.len()).await;

    let fetched = downloader.fetched.lock().unwrap().clone();
    let unique: HashSet<_> = fetched.iter().collect();
    assert_eq!(fetched.len(), links.len());
    assert_eq!(unique.len(), links.len());
    assert!(ledger.queue().is_empty());
    assert!(ledger.tasks().is_empty());

    shutdown.cancel();
    pool.await.unwrap();
}

#[tokio::test]
async fn removing_a_source_keeps_its_queued_items() {
    let dir = tempdir().unwrap();
    let ledger = ledger(&dir);
    let reader = Arc::new(MockFeedReader::default().with_feed(
        FEED_URL,
        vec![
            candidate("Ep1", "https://example.com/1", TimeDelta::hours(1)),
            candidate("Ep2", "https://example.com/2", TimeDelta::hours(2)),
        ],
    ));
    let registry = SourceRegistry::open(&dir.path().join("sources.yaml"), reader.clone()).unwrap();
    registry.add(FEED_URL, SourceType::Generic).await.unwrap();

    let (_config_tx, config_rx) = watch::channel(config(&dir, 1));
    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(PollContext {
        reader: reader.clone(),
        ledger: Arc::clone(&ledger),
        config: config_rx,
        reporter: NoopReporter::shared(),
    });
    let polling = tokio::spawn(scheduler.run(registry.subscribe(), shutdown.clone()));

    wait_until(|| ledger.queue().len() == 2).await;
    registry.remove(0).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let polls = reader.polls(FEED_URL);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(reader.polls(FEED_URL), polls);
    let queued: Vec<_> = ledger.queue().into_iter().map(|e| e.link).collect();
    assert_eq!(queued, ["https://example.com/1", "https://example.com/2"]);

    shutdown.cancel();
    polling.await.unwrap();
}

#[test]
fn config_save_then_load_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    let store = ConfigStore::open(&path).unwrap();

    let cfg = Config {
        sync_interval: Duration::from_secs(3600),
        parallel_downloads: 4,
        media_dir: dir.path().join("media"),
        address: "0.0.0.0".to_string(),
        port: 8080,
        download_filter: Some(DownloadFilter {
            max_age: Some(TimeDelta::days(7)),
            after: Some(Utc::now() - TimeDelta::days(30)),
            before: None,
        }),
        retry: RetryPolicy::default(),
    };
    store.save(cfg.clone()).unwrap();
    assert_eq!(store.load(), cfg);

    let mut invalid = cfg.clone();
    invalid.parallel_downloads = 0;
    assert!(store.save(invalid).is_err());
    assert_eq!(store.load(), cfg);

    // what is on disk matches too, at second precision for the timestamp
    let reopened = ConfigStore::open(&path).unwrap().load();
    assert_eq!(reopened.parallel_downloads, 4);
    assert_eq!(reopened.download_filter.as_ref().and_then(|f| f.max_age), Some(TimeDelta::days(7)));
    assert_eq!(
        reopened.download_filter.and_then(|f| f.after).map(|t| t.timestamp()),
        cfg.download_filter.and_then(|f| f.after).map(|t| t.timestamp())
    );
}

#[test]
fn after_constraint_splits_at_the_boundary() {
    let boundary = Utc::now() - TimeDelta::days(3);
    let filter = DownloadFilter {
        after: Some(boundary),
        ..Default::default()
    };
    let now = Utc::now();

    for minutes in -240..=240 {
        let published = boundary + TimeDelta::minutes(minutes);
        let item = Candidate {
            title: "item".to_string(),
            link: format!("https://example.com/{minutes}"),
            published_at: Some(published),
        };
        assert_eq!(
            filter::accept(&item, Some(&filter), now),
            published > boundary,
            "published {minutes} minutes from the boundary"
        );
    }
}
