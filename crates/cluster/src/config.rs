//! Configuration management for EasyCluster connections.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/easycluster/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{SharedKey, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecKind;
use crate::exception::ErrorMode;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("keep_alive_interval_secs must be greater than 0")]
    ZeroKeepAliveInterval,

    #[error("keep_alive_timeout_secs ({timeout}) must be larger than keep_alive_interval_secs ({interval})")]
    KeepAliveTimeoutTooShort { interval: u64, timeout: u64 },

    #[error("max_frame_size must be at least {min} bytes, got {got}")]
    MaxFrameSizeTooSmall { min: usize, got: usize },

    #[error("key_hex is not a valid key: {0}")]
    InvalidKey(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Smallest frame limit accepted by [`Config::validate`].
const MIN_FRAME_SIZE: usize = 1024;

/// Environment variable overriding the log level.
pub const LOG_LEVEL_ENV: &str = "EASYCLUSTER_LOG_LEVEL";

/// Environment variable overriding the shared key.
pub const KEY_ENV: &str = "EASYCLUSTER_KEY";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Per-connection settings shared by clients and servers.
    pub connection: ConnectionConfig,

    /// Listener settings for `easycluster serve`.
    pub server: ServerConfig,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Export registry the client asks the server to use.
    pub definitions_module: String,

    /// Interval at which the client asks the server for KEEPALIVE frames.
    pub keep_alive_interval_secs: Option<u64>,

    /// Silence after which a client with a dedicated reader gives up.
    pub keep_alive_timeout_secs: u64,

    /// Offer LZ4 compression; used only if both sides offer it.
    pub enable_compression: bool,

    /// Record serializer. Both sides must agree.
    pub codec: CodecKind,

    /// Default error surfacing for waited calls.
    pub error_mode: ErrorMode,

    /// Buffer requests issued before the handshake completes.
    pub queue_before_ready: bool,

    /// Largest accepted frame payload once the peer is verified.
    pub max_frame_size: usize,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: String,

    /// Shared key, hex encoded.
    pub key_hex: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            server: ServerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            definitions_module: "remote_code".to_string(),
            keep_alive_interval_secs: None,
            keep_alive_timeout_secs: 60,
            enable_compression: false,
            codec: CodecKind::default(),
            error_mode: ErrorMode::default(),
            queue_before_ready: true,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:11998".to_string(),
            key_hex: None,
        }
    }
}

impl ConnectionConfig {
    /// Keep-alive interval as a duration.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_secs.map(Duration::from_secs)
    }

    /// Reader timeout, only meaningful when keep-alives were requested.
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        self.keep_alive_interval_secs
            .map(|_| Duration::from_secs(self.keep_alive_timeout_secs))
    }
}

impl ServerConfig {
    /// Parses the configured key, if any.
    pub fn key(&self) -> Result<Option<SharedKey>, ConfigError> {
        self.key_hex
            .as_deref()
            .map(|hex| SharedKey::from_hex(hex).map_err(|e| ConfigError::InvalidKey(e.to_string())))
            .transpose()
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("easycluster")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - EASYCLUSTER_LOG_LEVEL: Override log level
    /// - EASYCLUSTER_KEY: Override the shared key (hex)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if !level.is_empty() {
                tracing::info!(level = %level, "Overriding log_level from environment");
                self.log_level = level;
            }
        }

        if let Ok(key) = std::env::var(KEY_ENV) {
            if !key.is_empty() {
                tracing::info!("Overriding key from environment");
                self.server.key_hex = Some(key);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        if let Some(interval) = self.connection.keep_alive_interval_secs {
            if interval == 0 {
                return Err(ConfigError::ZeroKeepAliveInterval);
            }
            if self.connection.keep_alive_timeout_secs <= interval {
                return Err(ConfigError::KeepAliveTimeoutTooShort {
                    interval,
                    timeout: self.connection.keep_alive_timeout_secs,
                });
            }
        }

        if self.connection.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::MaxFrameSizeTooSmall {
                min: MIN_FRAME_SIZE,
                got: self.connection.max_frame_size,
            });
        }

        self.server.key()?;

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load from `path`, or from the default path when none is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::load(default_config_path()),
        }
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
