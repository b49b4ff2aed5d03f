use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drainpipe::{Daemon, DaemonOptions};

/// Poll feeds and download new items into a local media library
#[derive(Parser, Debug)]
#[command(name = "drainpipe")]
#[command(about = "Poll feeds and download new items into a local media library")]
#[command(version)]
struct Args {
    /// Directory holding config.yaml and sources.yaml
    #[arg(long, env = "DRAINPIPE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory holding the library and pending downloads
    #[arg(long, env = "DRAINPIPE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Seconds in-flight downloads may keep running after shutdown is requested
    #[arg(long, default_value = "30")]
    drain_timeout: u64,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }

    fn options(&self) -> Result<DaemonOptions> {
        let config_dir = match &self.config_dir {
            Some(dir) => dir.clone(),
            None => dirs::config_dir()
                .context("No config directory on this platform, pass --config-dir")?
                .join("drainpipe"),
        };
        let data_dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .context("No data directory on this platform, pass --data-dir")?
                .join("drainpipe"),
        };
        Ok(DaemonOptions {
            config_dir,
            data_dir,
            drain_timeout: Duration::from_secs(self.drain_timeout),
        })
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},tower_http=warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C, or on SIGTERM from a service manager
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Shutdown requested (Ctrl+C)"),
        _ = terminate => info!("Shutdown requested (SIGTERM)"),
    }
}

async fn run(args: Args) -> Result<()> {
    let options = args.options()?;
    let daemon = Daemon::open(options).context("Failed to start drainpipe")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    daemon.run(shutdown).await.context("Daemon stopped with an error")
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_level());

    if let Err(e) = run(args).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
