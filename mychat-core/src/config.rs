//! Configuration management for mychat clients
//!
//! Config files are stored in platform-appropriate locations:
//! - Linux: ~/.config/mychat/
//! - macOS: ~/Library/Application Support/mychat/
//! - Windows: %APPDATA%\mychat\

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoDirFound,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,
}

/// Client-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL all API paths are joined onto
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// WebSocket endpoint; the access token is appended as `?token=`
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Path of the token refresh endpoint, relative to `api_base_url`
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,

    /// Upper bound for every request/response exchange, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Heartbeat period while the socket is open, in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

// Default value functions
fn default_api_base_url() -> String {
    format!("http://localhost:{}/api/v1", crate::DEFAULT_SERVER_PORT)
}
fn default_ws_url() -> String {
    format!("ws://localhost:{}/api/v1/ws", crate::DEFAULT_SERVER_PORT)
}
fn default_refresh_path() -> String {
    "/refresh-token".to_string()
}
fn default_request_timeout_ms() -> u64 {
    15_000
}
fn default_heartbeat_interval_ms() -> u64 {
    25_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_url: default_ws_url(),
            refresh_path: default_refresh_path(),
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("mychat"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
