//! Configuration system using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, default `config/bridge.toml`)
//! 2. Environment variables (prefixed with `IMAGING_BRIDGE_`)
//!
//! # Environment Variable Overrides
//!
//! The first underscore after the prefix separates the section from the
//! field, so snake_case field names map unambiguously:
//!
//! ```text
//! IMAGING_BRIDGE_SERVER_BIND_ADDR=0.0.0.0:8000
//! IMAGING_BRIDGE_CHANNEL_HOST=hugin.local
//! IMAGING_BRIDGE_CHANNEL_TIMEOUT_MS=20000
//! IMAGING_BRIDGE_APPLICATION_LOG_LEVEL=debug
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, BridgeResult};

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Device channel settings
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Webhook notification settings
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Trigger registry settings
    #[serde(default)]
    pub triggers: TriggerConfig,
    /// Image storage layout (used when building notification paths)
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            server: ServerConfig::default(),
            channel: ChannelConfig::default(),
            notify: NotifyConfig::default(),
            triggers: TriggerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory scanned at startup for imaging settings files
    #[serde(default = "default_settings_dir")]
    pub settings_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            settings_dir: default_settings_dir(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the REST API (host:port)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Device channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Device host
    #[serde(default = "default_channel_host")]
    pub host: String,
    /// Device port
    #[serde(default = "default_channel_port")]
    pub port: u16,
    /// Per-exchange timeout in milliseconds
    #[serde(default = "default_channel_timeout")]
    pub timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: default_channel_host(),
            port: default_channel_port(),
            timeout_ms: default_channel_timeout(),
        }
    }
}

impl ChannelConfig {
    /// Socket address string for the device endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Webhook notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Per-delivery HTTP timeout in milliseconds. Kept well below the channel
    /// timeout so one unreachable client cannot stall the dispatcher.
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_timeout_ms: default_webhook_timeout(),
        }
    }
}

/// Trigger registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Maximum number of retained trigger records. When full, the oldest
    /// terminal records are evicted first.
    #[serde(default = "default_retention_cap")]
    pub retention_cap: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            retention_cap: default_retention_cap(),
        }
    }
}

/// Image storage layout used to build notification path info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket name prefixed to image paths in notifications
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Base path inside the bucket
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            base_path: default_base_path(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_settings_dir() -> PathBuf {
    PathBuf::from("settings")
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_channel_host() -> String {
    "localhost".to_string()
}

fn default_channel_port() -> u16 {
    5555
}

fn default_channel_timeout() -> u64 {
    20_000
}

fn default_webhook_timeout() -> u64 {
    10_000
}

fn default_retention_cap() -> usize {
    1024
}

fn default_bucket() -> String {
    "imaging".to_string()
}

fn default_base_path() -> String {
    "images".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/bridge.toml` and environment variables.
    ///
    /// Precedence (highest to lowest): environment variables with the
    /// `IMAGING_BRIDGE_` prefix, then the TOML file, then built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns a `BridgeError` if the file cannot be parsed or validation
    /// fails.
    pub fn load() -> BridgeResult<Self> {
        Self::load_from("config/bridge.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            // Only the first underscore separates the section from the field,
            // so snake_case field names like `timeout_ms` pass through intact.
            .merge(
                Env::prefixed("IMAGING_BRIDGE_")
                    .map(|key| key.as_str().replacen('_', ".", 1).into()),
            )
            .extract()
            .map_err(BridgeError::Config)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Log level is one of trace, debug, info, warn, error
    /// - Channel timeout is nonzero
    /// - Webhook timeout is nonzero and not above the channel timeout
    /// - Retention cap is nonzero
    pub fn validate(&self) -> BridgeResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(BridgeError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.channel.timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "channel.timeout_ms must be > 0".to_string(),
            ));
        }

        if self.notify.webhook_timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "notify.webhook_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.notify.webhook_timeout_ms > self.channel.timeout_ms {
            return Err(BridgeError::Configuration(format!(
                "notify.webhook_timeout_ms ({}) must not exceed channel.timeout_ms ({})",
                self.notify.webhook_timeout_ms, self.channel.timeout_ms
            )));
        }

        if self.triggers.retention_cap == 0 {
            return Err(BridgeError::Configuration(
                "triggers.retention_cap must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
