//! Configuration schema and loading.
//!
//! TOML file plus environment overrides; every field has a default so an
//! empty file (or none at all) yields a working repository.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consumer worker threads. Defaults to the CPU count.
    pub worker_count: usize,
    /// Bounded intake queue depth; `publish` blocks once full.
    pub queue_depth: usize,
    /// Per-lock acquisition timeout.
    pub lock_timeout_ms: u64,
    /// Hosts for an NTP-backed physical time source. Consumed by such a
    /// source's constructor; the default clock ignores it.
    pub ntp_servers: Vec<String>,
    /// Per-subscriber notify budget; slower subscribers are logged.
    pub subscriber_timeout_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_depth: 1024,
            lock_timeout_ms: 30_000,
            ntp_servers: vec!["localhost".to_string()],
            subscriber_timeout_ms: 1_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_ms)
    }

    /// Worker count with the zero-means-default rule applied.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            default_worker_count()
        } else {
            self.worker_count
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"eventory=debug"`.
    pub filter: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
}

pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source: Box::new(source),
    })?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load a config file if given, falling back to defaults (with a warning)
/// on any failure. Environment overrides apply either way.
pub fn load_or_default(path: Option<&Path>) -> Config {
    match path {
        Some(path) => match load_from_path(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                let mut config = Config::default();
                apply_env_overrides(&mut config);
                config
            }
        },
        None => {
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            config
        }
    }
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Some(n) = env_parse("EVENTORY_WORKER_COUNT") {
        config.worker_count = n;
    }
    if let Some(n) = env_parse("EVENTORY_QUEUE_DEPTH") {
        config.queue_depth = n;
    }
    if let Some(n) = env_parse("EVENTORY_LOCK_TIMEOUT_MS") {
        config.lock_timeout_ms = n;
    }
    if let Some(n) = env_parse("EVENTORY_SUBSCRIBER_TIMEOUT_MS") {
        config.subscriber_timeout_ms = n;
    }
    if let Ok(filter) = std::env::var("EVENTORY_LOG")
        && !filter.is_empty()
    {
        config.logging.filter = Some(filter);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
