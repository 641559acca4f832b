//! Receiver configuration management.
//!
//! Configuration is stored as TOML, by default at
//! `~/.config/dbshuttle/receiver.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dbshuttle_transfer::SweepPolicy;
use serde::{Deserialize, Serialize};

/// Receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the file receiver binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Finished archives land here; partial chunks go under `.partial/`.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// JSON snapshot of the resume registry.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Largest chunk a client may negotiate, in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Completed transfers are forgotten after this much idle time.
    #[serde(default = "default_completed_max_age_secs")]
    pub completed_max_age_secs: u64,

    /// Incomplete transfers and their chunks are discarded after this much idle time.
    #[serde(default = "default_abandoned_max_age_secs")]
    pub abandoned_max_age_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7878".into()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/dbshuttle/received")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/dbshuttle/registry.json")
}

fn default_max_chunk_size() -> u64 {
    64 * 1024 * 1024
}

fn default_io_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_completed_max_age_secs() -> u64 {
    3600
}

fn default_abandoned_max_age_secs() -> u64 {
    86400
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_dir: default_storage_dir(),
            registry_path: default_registry_path(),
            max_chunk_size: default_max_chunk_size(),
            io_timeout_secs: default_io_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            completed_max_age_secs: default_completed_max_age_secs(),
            abandoned_max_age_secs: default_abandoned_max_age_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or writes and returns the default if
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            completed_max_age: Duration::from_secs(self.completed_max_age_secs),
            abandoned_max_age: Duration::from_secs(self.abandoned_max_age_secs),
        }
    }
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("dbshuttle")
        .join("receiver.toml")
}
