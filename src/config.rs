//! Runtime configuration.
//!
//! [`UploadConfig`] carries the coordinator tunables and can be read from a
//! JSON file; [`ServerConfig`] merges CLI arguments over `SHARDSTREAM_*`
//! environment variables for the server binary.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 20;
pub const DEFAULT_RETRY_CEILING: u32 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunables for the upload coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Fixed chunk size in bytes.
    pub chunk_size: usize,
    /// Maximum number of chunks in flight per session.
    pub max_in_flight: usize,
    /// Dispatch attempts per chunk before it fails permanently.
    pub retry_ceiling: u32,
    /// Linear backoff step; attempt `n` waits `n * step`.
    #[serde(with = "duration_ms")]
    pub retry_backoff_step: Duration,
    /// How long a chunk may wait for a capable server.
    #[serde(with = "duration_ms")]
    pub selection_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub selection_poll_interval: Duration,
    /// Hard timeout for a single chunk dispatch.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Required free space on a server, as a multiple of the chunk size.
    pub free_space_factor: u64,
    /// Preferred region for placement affinity.
    pub region: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            retry_backoff_step: Duration::from_secs(1),
            selection_timeout: Duration::from_secs(30),
            selection_poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(300),
            free_space_factor: 2,
            region: None,
        }
    }
}

impl UploadConfig {
    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn from_json_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be > 0".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be > 0".into()));
        }
        if self.retry_ceiling == 0 {
            return Err(ConfigError::Invalid("retry_ceiling must be > 0".into()));
        }
        Ok(())
    }

    /// Minimum free space a server needs to be eligible for a chunk.
    pub fn required_free_space(&self, chunk_size: u64) -> u64 {
        chunk_size.saturating_mul(self.free_space_factor)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Command-line + environment configuration for `shardstream-server`.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Chunked upload coordinator")]
pub struct ServerConfig {
    /// Address for the HTTP API
    #[arg(long, env = "SHARDSTREAM_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: String,

    /// SQLite URL for the ledger and account usage tables
    #[arg(
        long,
        env = "SHARDSTREAM_DATABASE_URL",
        default_value = "sqlite://./data/shardstream.db"
    )]
    pub database_url: String,

    /// JSON file listing storage servers
    #[arg(long, env = "SHARDSTREAM_SERVERS", default_value = "./servers.json")]
    pub servers_file: PathBuf,

    /// JSON file listing storage accounts and their quotas
    #[arg(long, env = "SHARDSTREAM_ACCOUNTS")]
    pub accounts_file: Option<PathBuf>,

    /// JSON file with upload tunables
    #[arg(long, env = "SHARDSTREAM_UPLOAD_CONFIG")]
    pub upload_config: Option<PathBuf>,

    /// Directory used to spool incoming HTTP uploads
    #[arg(long, env = "SHARDSTREAM_SPOOL_DIR", default_value = "./data/spool")]
    pub spool_dir: PathBuf,

    /// Accept self-signed certificates from storage nodes
    #[arg(long, env = "SHARDSTREAM_INSECURE")]
    pub insecure: bool,

    /// Milliseconds to wait for one storage node's status during a refresh
    #[arg(long, env = "SHARDSTREAM_STATUS_TIMEOUT_MS", default_value_t = 2000)]
    pub status_timeout_ms: u64,

    /// Largest accepted HTTP upload body in bytes; unlimited when unset
    #[arg(long, env = "SHARDSTREAM_MAX_UPLOAD_BYTES")]
    pub max_upload_bytes: Option<usize>,
}

impl ServerConfig {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn upload_config(&self) -> ConfigResult<UploadConfig> {
        match &self.upload_config {
            Some(path) => UploadConfig::from_json_file(path),
            None => Ok(UploadConfig::default()),
        }
    }
}
