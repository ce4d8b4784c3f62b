//! LiveUpdate Configuration Module
//! Handles loading and validating liveupdate.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::updater::security::ChecksumAlgorithm;

pub const CONFIG_FILE_NAME: &str = "liveupdate.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveUpdateConfig {
    /// Base URL of the update-metadata server
    pub server_url: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Version of the bundle compiled into the application binary
    pub embedded_version: String,
    /// Version of the native binary, checked against `min_binary_version`
    #[serde(default = "default_binary_version")]
    pub binary_version: String,
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default)]
    pub allow_downgrade: bool,
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_max_launch_attempts")]
    pub max_launch_attempts: u32,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub enforce_https: bool,
    /// Extra hosts on top of the server host
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub require_signature: bool,
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: u64,
    /// Hex-encoded Ed25519 public key
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Which checks a scheduler cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTypes {
    Live,
    Store,
    #[default]
    Both,
}

impl UpdateTypes {
    pub fn includes_live(&self) -> bool {
        matches!(self, UpdateTypes::Live | UpdateTypes::Both)
    }

    pub fn includes_store(&self) -> bool {
        matches!(self, UpdateTypes::Store | UpdateTypes::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub update_types: UpdateTypes,
    #[serde(default = "default_true")]
    pub respect_battery_optimization: bool,
    #[serde(default)]
    pub require_unmetered_network: bool,
    /// Download and activate live updates instead of only reporting them
    #[serde(default)]
    pub auto_apply: bool,
}

fn default_true() -> bool {
    true
}

fn default_channel() -> String {
    "production".to_string()
}

fn default_binary_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_keep_count() -> usize {
    2
}

fn default_readiness_timeout_secs() -> u64 {
    30
}

fn default_max_launch_attempts() -> u32 {
    3
}

fn default_max_bundle_size() -> u64 {
    50 * 1024 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_interval_secs() -> u64 {
    24 * 60 * 60
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enforce_https: true,
            allowed_hosts: Vec::new(),
            require_signature: false,
            checksum_algorithm: ChecksumAlgorithm::default(),
            max_bundle_size: default_max_bundle_size(),
            public_key: None,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            update_types: UpdateTypes::Both,
            respect_battery_optimization: true,
            require_unmetered_network: false,
            auto_apply: false,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl LiveUpdateConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILE_NAME)
        } else {
            path.to_path_buf()
        };
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: LiveUpdateConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Minimal config for a server, with every other field defaulted
    pub fn new(server_url: &str, embedded_version: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            channel: default_channel(),
            embedded_version: embedded_version.to_string(),
            binary_version: default_binary_version(),
            storage_dir: None,
            allow_downgrade: false,
            keep_count: default_keep_count(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            max_launch_attempts: default_max_launch_attempts(),
            security: SecurityConfig::default(),
            download: DownloadConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.server_url).map_err(|e| ConfigError::Invalid {
            field: "server_url",
            reason: e.to_string(),
        })?;
        semver::Version::parse(self.embedded_version.trim_start_matches('v')).map_err(|e| {
            ConfigError::Invalid {
                field: "embedded_version",
                reason: e.to_string(),
            }
        })?;
        if self.channel.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "channel",
                reason: "must not be empty".to_string(),
            });
        }
        if self.download.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "download.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.security.max_bundle_size == 0 {
            return Err(ConfigError::Invalid {
                field: "security.max_bundle_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.security.require_signature && self.security.public_key.is_none() {
            tracing::warn!("Signatures required but no public key configured; keystore will be consulted");
        }
        Ok(())
    }

    /// Resolved storage root
    ///
    /// Linux: ~/.local/share/liveupdate/
    /// Windows: %LOCALAPPDATA%\liveupdate\
    pub fn storage_root(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.storage_dir {
            return Ok(dir.clone());
        }
        dirs::data_local_dir()
            .map(|d| d.join("liveupdate"))
            .ok_or_else(|| ConfigError::Invalid {
                field: "storage_dir",
                reason: "could not determine local data directory".to_string(),
            })
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}
