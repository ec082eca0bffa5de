//! Configuration management for taskfleet using the prefer crate.
//!
//! Settings are layered: built-in defaults, then a config file (discovered
//! by prefer or passed explicitly), then environment variables. CLI flags
//! are applied last by the caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application name used for config discovery.
const APP_NAME: &str = "taskfleet";

/// Queue backend selected at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Redis Streams consumer group.
    #[default]
    Stream,
    /// RabbitMQ with retry and dead-letter queues.
    Broker,
    /// Single-process in-memory queue.
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Broker => "broker",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "redis" => Ok(Self::Stream),
            "broker" | "amqp" | "rabbitmq" => Ok(Self::Broker),
            "memory" => Ok(Self::Memory),
            other => Err(format!(
                "unknown backend '{}' (expected stream, broker or memory)",
                other
            )),
        }
    }
}

/// Resolved runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub backend: Backend,
    /// Redis URL for the stream backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// AMQP URL for the broker backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,
    /// Namespace for all keys and queues of one run.
    pub run_id: String,
    pub key_prefix: String,
    pub total_items: u64,
    pub chunk_size: u64,
    pub idle_timeout_secs: f64,
    pub stale_check_interval_secs: f64,
    pub stale_min_idle_secs: f64,
    /// Upper bound on deliveries taken over per stale check.
    pub stale_max_count: usize,
    /// Longest single wait inside `claim_next`.
    pub block_timeout_ms: u64,
    /// Broker backend only.
    pub max_retry_attempts: u32,
    /// Broker backend only.
    pub retry_delay_secs: f64,
    /// Attempts for a failing backend call before the worker gives up.
    pub backend_retry_attempts: u32,
    pub backend_retry_base_ms: u64,
    /// Whether this worker may seed the queue.
    pub seed: bool,
    /// Explicit worker ID (defaults to hostname-pid-random).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            redis_url: None,
            broker_url: None,
            run_id: "default".to_string(),
            key_prefix: APP_NAME.to_string(),
            total_items: 1000,
            chunk_size: 10,
            idle_timeout_secs: 90.0,
            stale_check_interval_secs: 15.0,
            stale_min_idle_secs: 60.0,
            stale_max_count: 10,
            block_timeout_ms: 2000,
            max_retry_attempts: 3,
            retry_delay_secs: 30.0,
            backend_retry_attempts: 5,
            backend_retry_base_ms: 200,
            seed: true,
            worker_id: None,
        }
    }
}

impl Settings {
    pub fn idle_timeout(&self) -> Duration {
        secs(self.idle_timeout_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        secs(self.stale_check_interval_secs)
    }

    pub fn stale_min_idle(&self) -> Duration {
        secs(self.stale_min_idle_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        secs(self.retry_delay_secs)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Check settings for values the worker can't run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than zero".into());
        }
        if self.block_timeout_ms == 0 {
            return Err("block_timeout_ms must be greater than zero".into());
        }
        for (name, value) in [
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("stale_check_interval_secs", self.stale_check_interval_secs),
            ("stale_min_idle_secs", self.stale_min_idle_secs),
            ("retry_delay_secs", self.retry_delay_secs),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("{} must be a positive number of seconds", name));
            }
        }
        // Survivors must stay up long enough to take over a crashed peer's
        // pending entries, or those entries are never reclaimed.
        if matches!(self.backend, Backend::Stream | Backend::Memory) {
            let recovery = self.stale_min_idle_secs + self.stale_check_interval_secs;
            if self.idle_timeout_secs <= recovery {
                return Err(format!(
                    "idle_timeout_secs ({}) must exceed stale_min_idle_secs + \
                     stale_check_interval_secs ({})",
                    self.idle_timeout_secs, recovery
                ));
            }
        }
        if self.run_id.is_empty() {
            return Err("run_id must not be empty".into());
        }
        match self.backend {
            Backend::Stream if self.redis_url.is_none() => {
                Err("stream backend requires redis_url (or REDIS_URL)".into())
            }
            Backend::Broker if self.broker_url.is_none() => {
                Err("broker backend requires broker_url (or BROKER_URL)".into())
            }
            _ => Ok(()),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Configuration file structure. Every field is optional; unset fields keep
/// the default from [`Settings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_check_interval_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_min_idle_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_max_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_retry_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Falls back to an empty config if no file is found or it fails to parse.
    pub async fn load() -> Self {
        match prefer::load(APP_NAME).await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Ignoring config file {}: {}", path.display(), e);
                        Self::default()
                    }
                },
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// Supports JSON, TOML and YAML based on file extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

        let mut config: Config = match ext {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e))?,
            _ => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Apply file values on top of `settings`.
    pub fn apply_to_settings(&self, settings: &mut Settings) {
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(ref value) = self.$field {
                    settings.$field = value.clone();
                })*
            };
        }
        apply!(
            backend,
            run_id,
            key_prefix,
            total_items,
            chunk_size,
            idle_timeout_secs,
            stale_check_interval_secs,
            stale_min_idle_secs,
            stale_max_count,
            block_timeout_ms,
            max_retry_attempts,
            retry_delay_secs,
            backend_retry_attempts,
            backend_retry_base_ms,
            seed,
        );
        if self.redis_url.is_some() {
            settings.redis_url = self.redis_url.clone();
        }
        if self.broker_url.is_some() {
            settings.broker_url = self.broker_url.clone();
        }
        if self.worker_id.is_some() {
            settings.worker_id = self.worker_id.clone();
        }
    }
}

/// Options controlling where settings come from.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (skips discovery).
    pub config_path: Option<PathBuf>,
}

/// Read a non-empty environment variable.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

/// Parse a non-empty environment variable, warning on bad values.
fn env_parse<T: FromStr>(name: &str) -> Option<T>
where
    T::Err: fmt::Display,
{
    let raw = env_var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring {}={}: {}", name, raw, e);
            None
        }
    }
}

/// Apply environment variable overrides. These take precedence over files.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(backend) = env_parse::<Backend>("TASKFLEET_BACKEND") {
        settings.backend = backend;
    }
    if let Some(url) = env_var("REDIS_URL") {
        tracing::debug!("Using REDIS_URL from environment");
        settings.redis_url = Some(url);
    }
    if let Some(url) = env_var("BROKER_URL") {
        tracing::debug!("Using BROKER_URL from environment");
        settings.broker_url = Some(url);
    }
    if let Some(run_id) = env_var("TASKFLEET_RUN_ID") {
        settings.run_id = run_id;
    }
    if let Some(worker_id) = env_var("TASKFLEET_WORKER_ID") {
        settings.worker_id = Some(worker_id);
    }
    if let Some(v) = env_parse("TASKFLEET_TOTAL_ITEMS") {
        settings.total_items = v;
    }
    if let Some(v) = env_parse("TASKFLEET_CHUNK_SIZE") {
        settings.chunk_size = v;
    }
    if let Some(v) = env_parse("TASKFLEET_IDLE_TIMEOUT_SECS") {
        settings.idle_timeout_secs = v;
    }
    if let Some(v) = env_parse("TASKFLEET_STALE_CHECK_INTERVAL_SECS") {
        settings.stale_check_interval_secs = v;
    }
    if let Some(v) = env_parse("TASKFLEET_STALE_MIN_IDLE_SECS") {
        settings.stale_min_idle_secs = v;
    }
    if let Some(v) = env_parse("TASKFLEET_MAX_RETRY_ATTEMPTS") {
        settings.max_retry_attempts = v;
    }
    if let Some(v) = env_parse("TASKFLEET_RETRY_DELAY_SECS") {
        settings.retry_delay_secs = v;
    }
}

/// Load settings with explicit options.
/// Returns (Settings, Config) tuple.
pub async fn load_settings_with_options(options: LoadOptions) -> (Settings, Config) {
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await.unwrap_or_else(|e| {
            tracing::warn!("{}", e);
            Config::default()
        }),
        None => Config::load().await,
    };

    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings);
    apply_env_overrides(&mut settings);

    (settings, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("stream".parse::<Backend>().unwrap(), Backend::Stream);
        assert_eq!("RabbitMQ".parse::<Backend>().unwrap(), Backend::Broker);
        assert_eq!(" memory ".parse::<Backend>().unwrap(), Backend::Memory);
        assert!("kafka".parse::<Backend>().is_err());
    }

    #[test]
    fn test_defaults_validate_for_memory_backend() {
        let settings = Settings {
            backend: Backend::Memory,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_backend_url() {
        let stream = Settings::default();
        assert!(stream.validate().unwrap_err().contains("redis_url"));

        let broker = Settings {
            backend: Backend::Broker,
            ..Default::default()
        };
        assert!(broker.validate().unwrap_err().contains("broker_url"));
    }

    #[test]
    fn test_validate_requires_idle_timeout_beyond_recovery_window() {
        let settings = Settings {
            redis_url: Some("redis://localhost:6379".into()),
            idle_timeout_secs: 30.0,
            stale_check_interval_secs: 15.0,
            stale_min_idle_secs: 60.0,
            ..Default::default()
        };
        assert!(settings
            .validate()
            .unwrap_err()
            .contains("idle_timeout_secs"));

        let settings = Settings {
            backend: Backend::Memory,
            idle_timeout_secs: 75.0,
            stale_check_interval_secs: 15.0,
            stale_min_idle_secs: 60.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        // The broker requeues on disconnect, so no reclaim window applies.
        let settings = Settings {
            backend: Backend::Broker,
            broker_url: Some("amqp://localhost:5672/%2f".into()),
            idle_timeout_secs: 30.0,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_timings_leave_room_for_recovery() {
        let settings = Settings {
            redis_url: Some("redis://localhost:6379".into()),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
        assert!(
            settings.idle_timeout() > settings.stale_min_idle() + settings.stale_check_interval()
        );
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let settings = Settings {
            backend: Backend::Memory,
            chunk_size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            backend: Backend::Memory,
            idle_timeout_secs: 0.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_toml_file_and_apply() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
backend = "broker"
broker_url = "amqp://localhost:5672/%2f"
total_items = 500
chunk_size = 25
max_retry_attempts = 5
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).await.unwrap();
        assert_eq!(config.backend, Some(Backend::Broker));
        assert_eq!(config.source_path.as_deref(), Some(file.path()));

        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings);
        assert_eq!(settings.backend, Backend::Broker);
        assert_eq!(settings.total_items, 500);
        assert_eq!(settings.chunk_size, 25);
        assert_eq!(settings.max_retry_attempts, 5);
        // Untouched fields keep their defaults.
        assert_eq!(settings.run_id, "default");
        assert!(settings.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "backend: memory\nidle_timeout_secs: 2.5").unwrap();

        let config = Config::load_from_path(file.path()).await.unwrap();
        assert_eq!(config.backend, Some(Backend::Memory));
        assert_eq!(config.idle_timeout_secs, Some(2.5));
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, "{{ not json").unwrap();
        assert!(Config::load_from_path(file.path()).await.is_err());
    }
}
