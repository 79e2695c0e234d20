//! Unified configuration for the unimask service.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (unimask.toml)
//! ```toml
//! [server]
//! listen = "0.0.0.0:7171"
//!
//! [storage]
//! data_dir = "/var/lib/unimask"
//! shard_count = 32
//! commit_delay_ms = 2000
//!
//! [auth]
//! secret = "change-me"
//! ```

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the unimask service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnimaskConfig {
    /// Network server configuration
    pub server: ServerConfig,
    /// Shard storage configuration
    pub storage: StorageConfig,
    /// Connection authentication
    pub auth: AuthConfig,
}

impl UnimaskConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(UnimaskConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // UNIMASK_STORAGE__SHARD_COUNT=8 style keys; single underscores stay in field names.
        figment = figment.merge(Env::prefixed("UNIMASK_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.shard_count == 0 {
            return Err(ConfigError::new("storage.shard_count must be at least 1"));
        }
        if self.auth.secret.is_empty() {
            return Err(ConfigError::new(
                "auth.secret is required (set --secret or UNIMASK_AUTH__SECRET)",
            ));
        }
        if self.server.read_timeout_ms == 0 || self.server.idle_timeout_ms == 0 {
            return Err(ConfigError::new(
                "server.read_timeout_ms and server.idle_timeout_ms must be positive",
            ));
        }
        if self.storage.commit_tick_ms == 0 {
            return Err(ConfigError::new("storage.commit_tick_ms must be positive"));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Read timeout for handshakes and partially received frames (milliseconds)
    pub read_timeout_ms: u64,
    /// Longest wait for the next frame on an authenticated connection (milliseconds)
    pub idle_timeout_ms: u64,
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7171)),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

/// Shard storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one RocksDB instance per shard
    pub data_dir: PathBuf,
    /// Number of shards (immutable once a data directory is created)
    pub shard_count: usize,
    /// Shared block cache size in MB
    pub cache_mb: usize,
    /// Age of the oldest unflushed write before a shard is committed (milliseconds)
    pub commit_delay_ms: u64,
    /// Lazy committer scan interval (milliseconds)
    pub commit_tick_ms: u64,
    /// Compact the shard's column families after each commit
    pub compact_on_commit: bool,
}

impl StorageConfig {
    /// Storage rooted at `data_dir` with every other setting at its default.
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn commit_delay(&self) -> Duration {
        Duration::from_millis(self.commit_delay_ms)
    }

    pub fn commit_tick(&self) -> Duration {
        Duration::from_millis(self.commit_tick_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            shard_count: DEFAULT_SHARD_COUNT,
            cache_mb: DEFAULT_CACHE_MB,
            commit_delay_ms: DEFAULT_COMMIT_DELAY_MS,
            commit_tick_ms: DEFAULT_COMMIT_TICK_MS,
            compact_on_commit: true,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret keying the connection handshake
    pub secret: String,
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
