//! Configuration System
//!
//! Loads configuration from a TOML file and applies `DEVICEHUB_*`
//! environment overrides on top.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::{BrokerConfig, OverflowPolicy};
use crate::notification::NotificationConfig;
use crate::websocket::HubConfig;
use crate::worker::MetricWorkerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub hubs: HubConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metric_workers: Vec<MetricWorkerConfig>,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins; any origin when empty
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Largest accepted request body, in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl ApiConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Background worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_command_interval")]
    pub command_interval_secs: u64,

    #[serde(default = "default_scheduled_task_interval")]
    pub scheduled_task_interval_secs: u64,

    /// Handlers each consumer loop runs at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_notifications_enabled")]
    pub notifications_enabled: bool,
}

fn default_command_interval() -> u64 {
    30
}

fn default_scheduled_task_interval() -> u64 {
    60
}

fn default_max_in_flight() -> usize {
    64
}

fn default_notifications_enabled() -> bool {
    true
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            command_interval_secs: default_command_interval(),
            scheduled_task_interval_secs: default_scheduled_task_interval(),
            max_in_flight: default_max_in_flight(),
            notifications_enabled: default_notifications_enabled(),
        }
    }
}

impl WorkersConfig {
    pub fn command_interval(&self) -> Duration {
        Duration::from_secs(self.command_interval_secs.max(1))
    }

    pub fn scheduled_task_interval(&self) -> Duration {
        Duration::from_secs(self.scheduled_task_interval_secs.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("devicehub").join("config.toml")),
            Some(PathBuf::from("/etc/devicehub/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `DEVICEHUB_*` overrides read through `var`
    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("DEVICEHUB_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = var("DEVICEHUB_API_PORT").and_then(|p| p.parse().ok()) {
            self.api.port = port;
        }

        if let Some(capacity) = var("DEVICEHUB_BROKER_QUEUE_CAPACITY").and_then(|c| c.parse().ok()) {
            self.broker.queue_capacity = capacity;
        }
        match var("DEVICEHUB_BROKER_OVERFLOW").as_deref() {
            Some("block") => self.broker.overflow = OverflowPolicy::Block,
            Some("drop_newest") => self.broker.overflow = OverflowPolicy::DropNewest,
            _ => {}
        }

        if let Some(secs) = var("DEVICEHUB_COMMAND_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.workers.command_interval_secs = secs;
        }
        if let Some(secs) = var("DEVICEHUB_SCHEDULED_TASK_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.workers.scheduled_task_interval_secs = secs;
        }

        if let Some(endpoint) = var("DEVICEHUB_EMAIL_ENDPOINT") {
            self.notifications.email_endpoint = Some(endpoint);
        }
        if let Some(endpoint) = var("DEVICEHUB_PUSH_ENDPOINT") {
            self.notifications.push_endpoint = Some(endpoint);
        }
        if let Some(key) = var("DEVICEHUB_NOTIFICATION_API_KEY") {
            self.notifications.api_key = Some(key);
        }

        if let Some(level) = var("DEVICEHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("DEVICEHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# devicehub configuration
#
# Environment variables override these settings:
# - DEVICEHUB_API_HOST, DEVICEHUB_API_PORT
# - DEVICEHUB_BROKER_QUEUE_CAPACITY, DEVICEHUB_BROKER_OVERFLOW
# - DEVICEHUB_COMMAND_INTERVAL_SECS, DEVICEHUB_SCHEDULED_TASK_INTERVAL_SECS
# - DEVICEHUB_EMAIL_ENDPOINT, DEVICEHUB_PUSH_ENDPOINT, DEVICEHUB_NOTIFICATION_API_KEY
# - DEVICEHUB_LOG_LEVEL, DEVICEHUB_LOG_FORMAT

[api]
host = "0.0.0.0"
port = 8080

# Allowed CORS origins, any origin when empty
cors_origins = []

# Largest accepted request body (bytes)
max_body_size = 1048576

[broker]
# Pending messages per subscriber
queue_capacity = 64

# What to do when a subscriber queue is full: "drop_newest" or "block"
overflow = "drop_newest"

# Messages parked per subscriber under "block" before drops start
block_backlog = 1024

[workers]
command_interval_secs = 30
scheduled_task_interval_secs = 60

# Handlers each worker runs at once
max_in_flight = 64

notifications_enabled = true

[hubs]
ping_interval_secs = 54
read_timeout_secs = 60
write_timeout_secs = 10

# Largest inbound WebSocket message (bytes)
max_message_size = 512

broadcast_capacity = 256
client_queue_capacity = 64

[notifications]
# Notifications are only logged while no endpoint is set
# email_endpoint = "https://mail.example.com/v1/send"
# push_endpoint = "https://push.example.com/v1/send"
# api_key = ""
from_address = "notifications@devicehub.local"
max_attempts = 3
backoff_ms = 1000
request_timeout_ms = 30000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Metrics recorded from broker events
# [[metric_workers]]
# name = "soil_temperature"
# kind = "gauge"
# topic = "device_messages"
# event = "uplink"
# value_path = "decoded_payload.temperature.0.value"
#
# [metric_workers.labels]
# device_id = "device_id"
"#
    .to_string()
}
