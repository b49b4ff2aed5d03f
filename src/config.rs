// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::download::RetryPolicy;
use crate::error::ConfigError;
use crate::filter::DownloadFilter;
use crate::persist;

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(900);
const DEFAULT_PORT: u16 = 9193;
const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// Daemon configuration.
///
/// Saving always replaces the whole value; optional fields that are absent
/// (or empty strings) are cleared rather than merged with the previous config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Time between two polls of the same source (seconds on the wire)
    #[serde(serialize_with = "serialize_secs", deserialize_with = "deserialize_secs")]
    pub sync_interval: Duration,
    /// Number of concurrent download workers
    pub parallel_downloads: usize,
    /// Root directory for downloaded media
    pub media_dir: PathBuf,
    /// Address the API listens on
    pub address: String,
    /// Port the API listens on
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_filter: Option<DownloadFilter>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            parallel_downloads: 1,
            media_dir: dirs::home_dir().unwrap_or_default().join("media"),
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            download_filter: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Check the invariants a stored configuration must hold
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_downloads < 1 {
            return Err(ConfigError::Invalid(
                "parallel_downloads must be at least 1".to_string(),
            ));
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sync_interval must be greater than 0".to_string(),
            ));
        }
        if self.sync_interval.subsec_nanos() != 0 {
            return Err(ConfigError::Invalid(
                "sync_interval must be a whole number of seconds".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be between 1 and 65535".to_string()));
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".to_string()));
        }
        if self.media_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("media_dir must not be empty".to_string()));
        }
        if let Some(max_age) = self.download_filter.as_ref().and_then(|f| f.max_age) {
            if max_age < TimeDelta::zero() {
                return Err(ConfigError::Invalid(
                    "download_filter.max_age must not be negative".to_string(),
                ));
            }
            if max_age.subsec_nanos() != 0 {
                return Err(ConfigError::Invalid(
                    "download_filter.max_age must be a whole number of seconds".to_string(),
                ));
            }
        }
        if self.retry.max_attempts < 1 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a config from a JSON payload, reporting shape errors as invalid config
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from a web GUI payload on top of `current`.
    ///
    /// The GUI never shows `retry`, so a payload without it keeps the
    /// current policy instead of resetting it to the defaults.
    pub fn from_gui_json(value: serde_json::Value, current: &Config) -> Result<Self, ConfigError> {
        let keeps_retry = value.get("retry").is_none();
        let mut config = Self::from_json(value)?;
        if keeps_retry {
            config.retry = current.retry;
        }
        Ok(config)
    }

    /// `address:port` for the API listener
    pub fn bind_addr(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// The fields the web GUI renders and edits.
///
/// `retry` is left out: the GUI builds one input per scalar key and has no
/// input for it. It stays tunable in `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditableConfig {
    #[serde(serialize_with = "serialize_secs")]
    pub sync_interval: Duration,
    pub parallel_downloads: usize,
    pub media_dir: PathBuf,
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_filter: Option<DownloadFilter>,
}

impl From<Config> for EditableConfig {
    fn from(config: Config) -> Self {
        Self {
            sync_interval: config.sync_interval,
            parallel_downloads: config.parallel_downloads,
            media_dir: config.media_dir,
            address: config.address,
            port: config.port,
            download_filter: config.download_filter,
        }
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

fn deserialize_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Persisted, validated configuration with change notification
pub struct ConfigStore {
    path: PathBuf,
    tx: watch::Sender<Config>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Open the store at `path`, writing defaults if the file does not exist
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = persist::load_or_create(path)?;
        config.validate()?;
        info!(
            sync_interval = config.sync_interval.as_secs(),
            parallel_downloads = config.parallel_downloads,
            "Loaded configuration"
        );
        let (tx, _rx) = watch::channel(config);
        Ok(Self {
            path: path.to_path_buf(),
            tx,
            write_lock: Mutex::new(()),
        })
    }

    /// Current configuration
    pub fn load(&self) -> Config {
        self.tx.borrow().clone()
    }

    /// Validate, persist and publish a new configuration.
    ///
    /// On any error the previous configuration stays in effect.
    #[instrument(skip_all)]
    pub fn save(&self, config: Config) -> Result<Config, ConfigError> {
        config.validate()?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        persist::save(&config, &self.path)?;
        self.tx.send_replace(config.clone());
        info!(
            sync_interval = config.sync_interval.as_secs(),
            parallel_downloads = config.parallel_downloads,
            "Configuration saved"
        );
        Ok(config)
    }

    /// Re-read the file after it was edited by hand.
    ///
    /// A file that fails to parse or validate is ignored and the current
    /// configuration stays in effect. Returns whether anything changed.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let config: Config = persist::load(&self.path)?;
        config.validate()?;

        let changed = self.tx.send_if_modified(|current| {
            if *current == config {
                return false;
            }
            *current = config.clone();
            true
        });
        if changed {
            info!(
                sync_interval = config.sync_interval.as_secs(),
                parallel_downloads = config.parallel_downloads,
                "Configuration reloaded from disk"
            );
        }
        Ok(changed)
    }

    /// Receive every configuration published after this call
    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.tx.subscribe()
    }
}
