use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration file (`spool.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpoolConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Bounded executor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum aggregate estimated footprint of queued entries, in bytes.
    pub write_buffer_limit_bytes: u64,
    /// Entries measured individually before sampling kicks in.
    pub sample_warmup: u64,
    /// After warm-up, measure one entry out of every `sample_rate`.
    pub sample_rate: u64,
    /// Hard cap on effective capacity regardless of how small entries are.
    pub max_cached_records: usize,
    /// Prefix for worker thread names (`<prefix>-producer-0`, ...).
    pub thread_name_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            write_buffer_limit_bytes: 4 * 1024 * 1024,
            sample_warmup: 16,
            sample_rate: 64,
            max_cached_records: 128 * 1024,
            thread_name_prefix: "spool".into(),
        }
    }
}

impl ExecutorConfig {
    /// Defaults with the given byte budget.
    pub fn with_buffer_limit(write_buffer_limit_bytes: u64) -> Self {
        Self {
            write_buffer_limit_bytes,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_buffer_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "executor.write_buffer_limit_bytes must be > 0".into(),
            ));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("executor.sample_rate must be > 0".into()));
        }
        if self.max_cached_records == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_cached_records must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Logging and metrics setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Prometheus listen address; empty disables the exporter.
    pub metrics_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,spool=debug".into(),
            metrics_addr: String::new(),
        }
    }
}

impl SpoolConfig {
    /// Parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: SpoolConfig = toml::from_str(content)?;
        config.executor.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(ConfigError::Io(_)) => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load config {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.write_buffer_limit_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.sample_warmup, 16);
        assert_eq!(cfg.sample_rate, 64);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg = SpoolConfig::from_toml(
            r#"
            [executor]
            write_buffer_limit_bytes = 1024
            "#,
        )
        .unwrap();
        assert_eq!(cfg.executor.write_buffer_limit_bytes, 1024);
        assert_eq!(cfg.executor.sample_rate, 64);
        assert_eq!(cfg.observability, ObservabilityConfig::default());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = SpoolConfig::from_toml("[executor]\nwrite_buffer_limit_bytes = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{:?}", err);
    }

    #[test]
    fn test_zero_sample_rate_rejected() {
        let cfg = ExecutorConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let err = SpoolConfig::from_toml("[executor\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[executor]\nsample_warmup = 4\nthread_name_prefix = \"hoodie\"\n\n[observability]\nmetrics_addr = \"127.0.0.1:9100\""
        )
        .unwrap();
        let cfg = SpoolConfig::load(file.path()).unwrap();
        assert_eq!(cfg.executor.sample_warmup, 4);
        assert_eq!(cfg.executor.thread_name_prefix, "hoodie");
        assert_eq!(cfg.observability.metrics_addr, "127.0.0.1:9100");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SpoolConfig::load_or_default(dir.path().join("absent.toml"));
        assert_eq!(cfg.executor, ExecutorConfig::default());
    }

    #[test]
    fn test_roundtrip_default_to_toml() {
        let text = toml::to_string_pretty(&SpoolConfig::default()).unwrap();
        let back = SpoolConfig::from_toml(&text).unwrap();
        assert_eq!(back.executor, ExecutorConfig::default());
    }
}
