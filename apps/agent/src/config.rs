//! Agent configuration management.
//!
//! Configuration is stored as TOML, by default at
//! `~/.config/dbshuttle/agent.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dbshuttle_backup::ConnectionInfo;
use dbshuttle_data_channel::{RetryPolicy, TransferConfig};
use serde::{Deserialize, Serialize};

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Receiver address (`host:port`).
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,

    /// How long to wait for the receiver to reassemble and verify.
    #[serde(default = "default_finalize_timeout_secs")]
    pub finalize_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Service manager unit of the MySQL instance.
    #[serde(default = "default_mysql_service")]
    pub mysql_service: String,

    #[serde(default = "default_mysql_host")]
    pub mysql_host: String,

    #[serde(default = "default_mysql_port")]
    pub mysql_port: u16,

    /// MySQL data directory to archive.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where archives are written before transfer.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// JSON-lines log of backup outcomes.
    #[serde(default = "default_outcome_log")]
    pub outcome_log: PathBuf,

    /// Keep archives after a confirmed transfer.
    #[serde(default)]
    pub keep_archive: bool,
}

/// Backoff settings for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_server_addr() -> String {
    "127.0.0.1:7878".into()
}

fn default_chunk_size() -> u64 {
    dbshuttle_protocol::constants::DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent_chunks() -> usize {
    dbshuttle_protocol::constants::DEFAULT_MAX_CONCURRENT_CHUNKS
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_io_timeout_secs() -> u64 {
    60
}

fn default_finalize_timeout_secs() -> u64 {
    600
}

fn default_mysql_service() -> String {
    "mysql".into()
}

fn default_mysql_host() -> String {
    "127.0.0.1".into()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mysql")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/tmp/dbshuttle")
}

fn default_outcome_log() -> PathBuf {
    PathBuf::from("/var/lib/dbshuttle/outcomes.jsonl")
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            chunk_size: default_chunk_size(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            connect_timeout_secs: default_connect_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            finalize_timeout_secs: default_finalize_timeout_secs(),
            retry: RetryConfig::default(),
            mysql_service: default_mysql_service(),
            mysql_host: default_mysql_host(),
            mysql_port: default_mysql_port(),
            data_dir: default_data_dir(),
            archive_dir: default_archive_dir(),
            outcome_log: default_outcome_log(),
            keep_archive: false,
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

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size,
            max_concurrent_chunks: self.max_concurrent_chunks,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            finalize_timeout: Duration::from_secs(self.finalize_timeout_secs),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                backoff_factor: self.retry.backoff_factor,
                max_attempts: self.retry.max_attempts.max(1),
            },
            ..TransferConfig::new(self.server_addr.clone())
        }
    }

    pub fn connection(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.mysql_host.clone(),
            port: self.mysql_port,
        }
    }
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("dbshuttle")
        .join("agent.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 50 * 1024 * 1024);
        assert_eq!(config.max_concurrent_chunks, 4);
        assert_eq!(config.mysql_service, "mysql");
        assert!(!config.keep_archive);

        let transfer = config.transfer_config();
        assert_eq!(transfer.server_addr, "127.0.0.1:7878");
        assert_eq!(transfer.connect_timeout, Duration::from_secs(30));
        assert_eq!(transfer.retry, RetryPolicy::default());
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
            server_addr = "backup.example:7878"
            keep_archive = true

            [retry]
            max_attempts = 9
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server_addr, "backup.example:7878");
        assert!(config.keep_archive);
        assert_eq!(config.retry.max_attempts, 9);
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/mysql"));
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            server_addr: "10.0.0.5:9000".into(),
            chunk_size: 1024,
            mysql_port: 3307,
            ..Config::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server_addr, "10.0.0.5:9000");
        assert_eq!(parsed.chunk_size, 1024);
        assert_eq!(parsed.connection().port, 3307);
    }

    #[test]
    fn load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");
        let config = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.mysql_service, "mysql");
    }
}
