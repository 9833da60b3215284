//! Configuration management for the bucket loader
//!
//! Configuration comes from a TOML file, from `BUCKET_LOADER_*` environment
//! variables, or from defaults. Every section has defaults so partial files
//! are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound for `heartbeat_timeout_secs` (one week)
pub const MAX_HEARTBEAT_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared store configuration
    pub database: DatabaseConfig,

    /// Loader timing and batch configuration
    pub loader: LoaderConfig,

    /// Retry policy for transient store errors
    pub retry: RetrySettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Which shared store backs the coordination tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(Error::config(format!("unknown database backend: {other}"))),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: Backend,

    /// SQLite database path (shared by every instance on the host)
    pub sqlite_path: PathBuf,

    /// How long SQLite waits on a locked database before giving up
    pub busy_timeout_ms: u64,

    /// PostgreSQL connection string
    pub postgres_url: String,

    /// Maximum pool size
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            sqlite_path: PathBuf::from("data/bucket-loader.db"),
            busy_timeout_ms: 5_000,
            postgres_url: String::from("postgresql://localhost/bucket_loader"),
            pool_size: 10,
        }
    }
}

/// Loader timing and batch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// How often this instance writes its heartbeat
    pub heartbeat_interval_secs: u64,

    /// An instance whose heartbeat is older than this is considered dead
    pub heartbeat_timeout_secs: u64,

    /// Maximum bundles claimed per allocation
    pub claim_batch_size: usize,

    /// Delay between claim attempts when no work is available
    pub poll_interval_secs: u64,

    /// How often the reclaim sweep runs
    pub reclaim_interval_secs: u64,

    /// How often buckets are rescanned; 0 disables scanning
    pub scan_interval_secs: u64,

    /// Allocation ids reserved per round trip by the SQLite backend
    pub allocation_cache_size: i64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 60,
            claim_batch_size: 10,
            poll_interval_secs: 5,
            reclaim_interval_secs: 30,
            scan_interval_secs: 300,
            allocation_cache_size: 1000,
        }
    }
}

/// Retry policy for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `BUCKET_LOADER_*` environment variables onto this configuration
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var("BUCKET_LOADER_BACKEND") {
            self.database.backend = backend.parse()?;
        }
        if let Ok(path) = std::env::var("BUCKET_LOADER_SQLITE_PATH") {
            self.database.sqlite_path = path.into();
        }
        if let Ok(url) =
            std::env::var("BUCKET_LOADER_POSTGRES_URL").or_else(|_| std::env::var("DATABASE_URL"))
        {
            self.database.postgres_url = url;
        }
        if let Some(size) = env_parse("BUCKET_LOADER_POOL_SIZE") {
            self.database.pool_size = size;
        }
        if let Some(secs) = env_parse("BUCKET_LOADER_HEARTBEAT_INTERVAL") {
            self.loader.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = env_parse("BUCKET_LOADER_HEARTBEAT_TIMEOUT") {
            self.loader.heartbeat_timeout_secs = secs;
        }
        if let Some(size) = env_parse("BUCKET_LOADER_CLAIM_BATCH_SIZE") {
            self.loader.claim_batch_size = size;
        }
        if let Ok(level) = std::env::var("BUCKET_LOADER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("BUCKET_LOADER_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::with_source(format!("Failed to read config file: {}", path.display()), e)
        })?;

        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let loader = &self.loader;

        if loader.heartbeat_interval_secs == 0 {
            return Err(Error::config("heartbeat_interval_secs must be greater than 0"));
        }
        if loader.heartbeat_timeout_secs > MAX_HEARTBEAT_TIMEOUT_SECS {
            return Err(Error::config(format!(
                "heartbeat_timeout_secs must be at most {MAX_HEARTBEAT_TIMEOUT_SECS}"
            )));
        }
        if loader.heartbeat_interval_secs >= loader.heartbeat_timeout_secs {
            return Err(Error::config(
                "heartbeat_interval_secs must be shorter than heartbeat_timeout_secs",
            ));
        }
        if loader.claim_batch_size == 0 {
            return Err(Error::config("claim_batch_size must be greater than 0"));
        }
        if loader.poll_interval_secs == 0 || loader.reclaim_interval_secs == 0 {
            return Err(Error::config(
                "poll_interval_secs and reclaim_interval_secs must be greater than 0",
            ));
        }
        if loader.allocation_cache_size < 1 {
            return Err(Error::config("allocation_cache_size must be at least 1"));
        }
        if self.database.pool_size == 0 {
            return Err(Error::config("pool_size must be greater than 0"));
        }

        Ok(())
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.loader.heartbeat_interval_secs)
    }

    /// Liveness timeout used by the reclaim sweep, clamped to
    /// [`MAX_HEARTBEAT_TIMEOUT_SECS`]
    #[must_use]
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        let secs = self.loader.heartbeat_timeout_secs.min(MAX_HEARTBEAT_TIMEOUT_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database.busy_timeout_ms)
    }
}
