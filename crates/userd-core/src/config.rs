//! Configuration management for the service.

use crate::{CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default Redis connection URL for the event channel.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default event stream key (the legacy notification topic name).
pub const DEFAULT_EVENT_STREAM: &str = "user-events";

/// Main service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Redis connection URL for the event channel.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Stream key that user events are published to.
    #[serde(default = "default_event_stream")]
    pub event_stream: String,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_string()
}

fn default_event_stream() -> String {
    DEFAULT_EVENT_STREAM.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            redis_url: default_redis_url(),
            event_stream: default_event_stream(),
        }
    }
}

impl Config {
    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment variable overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("USERD_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(redis_url) = std::env::var("USERD_REDIS_URL") {
            self.redis_url = redis_url;
        }
        if let Ok(event_stream) = std::env::var("USERD_EVENT_STREAM") {
            self.event_stream = event_stream;
        }
    }
}
