//! Picks up hand edits to `config.yaml` and `sources.yaml` while the daemon
//! runs.
//!
//! The config directory is watched rather than the files themselves, since
//! every save replaces the file through a rename.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConfigStore;
use crate::sources::SourceRegistry;

/// Which store a file event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Config,
    Sources,
}

/// File names of the stores inside the watched directory
#[derive(Debug, Clone)]
pub struct WatchedFiles {
    pub dir: PathBuf,
    pub config: String,
    pub sources: String,
}

impl WatchedFiles {
    fn targets(&self, event: &Event) -> Vec<Target> {
        let mut targets = Vec::new();
        for name in event.paths.iter().filter_map(|p| p.file_name()) {
            let target = if name == OsStr::new(&self.config) {
                Target::Config
            } else if name == OsStr::new(&self.sources) {
                Target::Sources
            } else {
                continue;
            };
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }
}

type EventReceiver = mpsc::UnboundedReceiver<notify::Result<Event>>;

fn start_watcher(dir: &Path) -> notify::Result<(RecommendedWatcher, EventReceiver)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

/// Watch the config directory and reload the stores until `shutdown` fires.
///
/// Reload failures are logged and the previous value stays in effect.
pub fn spawn_reloader(
    files: WatchedFiles,
    config: Arc<ConfigStore>,
    sources: Arc<SourceRegistry>,
    shutdown: CancellationToken,
) -> notify::Result<JoinHandle<()>> {
    let (watcher, mut events) = start_watcher(&files.dir)?;
    debug!(dir = %files.dir.display(), "Watching config directory");

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let event = match event {
                Ok(event) if !event.kind.is_access() => event,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "File watcher error");
                    continue;
                }
            };

            for target in files.targets(&event) {
                match target {
                    Target::Config => {
                        if let Err(e) = config.reload() {
                            warn!(error = %e, "Ignoring edited config file");
                        }
                    }
                    Target::Sources => {
                        if let Err(e) = sources.reload().await {
                            warn!(error = %e, "Ignoring edited sources file");
                        }
                    }
                }
            }
        }
        debug!("Config watcher stopped");
    }))
}
