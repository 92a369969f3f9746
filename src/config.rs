//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::LimiterConfig;

/// Prefix for environment overrides, e.g. `TOLLGATE__LIMITER__PER_ENTRY_MAX_TOKEN=10`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Rate limiter parameters
    #[serde(default)]
    pub limiter: LimiterSettings,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads for background tasks; defaults to available parallelism
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl RuntimeConfig {
    /// The configured worker thread count, rejecting zero.
    pub fn validated_worker_threads(&self) -> Result<Option<usize>> {
        match self.worker_threads {
            Some(0) => Err(LimiterError::Config(
                "runtime.worker_threads must be at least 1".to_string(),
            )),
            threads => Ok(threads),
        }
    }
}

/// Rate limiter parameters as they appear in a configuration file.
///
/// Every field is optional so that a missing value is reported as an
/// invalid configuration rather than silently defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Initial capacity hint for the bucket map
    pub bucket_capacity: Option<u64>,

    /// Maximum tokens held per client
    pub per_entry_max_token: Option<u32>,

    /// Idle time after which a client is forgotten, in milliseconds
    pub cleanup_interval_ms: Option<u64>,

    /// Interval between token grants, in milliseconds
    pub fill_up_rate_ms: Option<u64>,

    /// Interval of the idle check, in milliseconds
    pub shut_down_duration_ms: Option<u64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            bucket_capacity: Some(10),
            per_entry_max_token: Some(5),
            cleanup_interval_ms: Some(10_000),
            fill_up_rate_ms: Some(1_000),
            shut_down_duration_ms: Some(60_000),
        }
    }
}

impl LimiterSettings {
    /// Validate the settings and turn them into a [`LimiterConfig`].
    pub fn to_limiter_config(&self) -> Result<LimiterConfig> {
        fn required<T: Copy>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| LimiterError::InvalidConfiguration(format!("{} is not set", name)))
        }

        LimiterConfig::new(
            required(self.bucket_capacity, "bucket_capacity")?,
            required(self.per_entry_max_token, "per_entry_max_token")?,
            Duration::from_millis(required(self.cleanup_interval_ms, "cleanup_interval_ms")?),
            Duration::from_millis(required(self.fill_up_rate_ms, "fill_up_rate_ms")?),
            Duration::from_millis(required(self.shut_down_duration_ms, "shut_down_duration_ms")?),
        )
    }
}

impl TollgateConfig {
    /// Load configuration from a file, layered with `TOLLGATE__*` environment overrides.
    ///
    /// The format is taken from the file extension (YAML, TOML or JSON).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(LimiterError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("configuration file {} not found", path.display()),
            )));
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TollgateConfig::default();
        let limiter = config.limiter.to_limiter_config().unwrap();

        assert_eq!(limiter.per_entry_max_token(), 5);
        assert_eq!(limiter.fill_up_rate(), Duration::from_secs(1));
        assert_eq!(limiter.cleanup_interval(), Duration::from_secs(10));
        assert_eq!(limiter.shut_down_duration(), Duration::from_secs(60));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.runtime.worker_threads.is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
logging:
  level: debug
  format: json
runtime:
  worker_threads: 2
limiter:
  bucket_capacity: 100
  per_entry_max_token: 3
  cleanup_interval_ms: 10000
  fill_up_rate_ms: 1000
  shut_down_duration_ms: 30000
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.runtime.worker_threads, Some(2));

        let limiter = config.limiter.to_limiter_config().unwrap();
        assert_eq!(limiter.bucket_capacity(), 100);
        assert_eq!(limiter.per_entry_max_token(), 3);
    }

    #[test]
    fn test_missing_duration_is_invalid() {
        let yaml = r#"
limiter:
  bucket_capacity: 10
  per_entry_max_token: 3
  cleanup_interval_ms: 10000
  shut_down_duration_ms: 30000
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        let err = config.limiter.to_limiter_config().unwrap_err();
        assert!(matches!(err, LimiterError::InvalidConfiguration(ref msg) if msg.contains("fill_up_rate_ms")));
    }

    #[test]
    fn test_zero_worker_threads_rejected() {
        let config = TollgateConfig::from_yaml("runtime:\n  worker_threads: 0\n").unwrap();
        let err = config.runtime.validated_worker_threads().unwrap_err();
        assert!(matches!(err, LimiterError::Config(ref msg) if msg.contains("worker_threads")));

        let config = TollgateConfig::from_yaml("runtime:\n  worker_threads: 4\n").unwrap();
        assert_eq!(config.runtime.validated_worker_threads().unwrap(), Some(4));
        assert_eq!(RuntimeConfig::default().validated_worker_threads().unwrap(), None);
    }

    #[test]
    fn test_malformed_yaml() {
        let err = TollgateConfig::from_yaml("limiter: [not, a, map]").unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "limiter:\n  bucket_capacity: 8\n  per_entry_max_token: 4\n  cleanup_interval_ms: 500\n  fill_up_rate_ms: 50\n  shut_down_duration_ms: 1000\n",
        )
        .unwrap();

        let config = TollgateConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let limiter = config.limiter.to_limiter_config().unwrap();
        assert_eq!(limiter.per_entry_max_token(), 4);
        assert_eq!(limiter.fill_up_rate(), Duration::from_millis(50));
    }

    #[test]
    fn test_from_missing_file() {
        let err = TollgateConfig::from_file("/nonexistent/tollgate.yaml").unwrap_err();
        assert!(matches!(err, LimiterError::Io(_)));
    }
}
