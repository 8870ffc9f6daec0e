//! Configuration for experiment data handling.
//!
//! Supports loading configuration from:
//! 1. Configuration files (YAML)
//! 2. Environment variables (with `ARVAK_EXPDATA_` prefix)
//!
//! Configuration precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::service::{ExperimentService, JsonFileService, MemoryService, ServiceResult};
use crate::tracing_config::{TracingConfig, TracingFormat};

/// Experiment data configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Size of the analysis callback pool.
    #[serde(default = "default_analysis_workers")]
    pub analysis_workers: usize,

    /// How long `cancel_analysis` waits for cancelled callbacks to settle,
    /// in milliseconds.
    #[serde(default = "default_cancel_wait_ms")]
    pub cancel_wait_ms: u64,

    /// Initial auto-save flag of new experiments.
    #[serde(default)]
    pub auto_save: bool,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Experiment service configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "console" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Experiment service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Service type: "memory" or "json"
    #[serde(default = "default_storage_type")]
    pub backend: String,

    /// Base directory of the "json" service
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// Default value functions
fn default_analysis_workers() -> usize {
    crate::task::DEFAULT_ANALYSIS_WORKERS
}

fn default_cancel_wait_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

fn default_storage_type() -> String {
    "memory".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_type(),
            path: None,
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            analysis_workers: default_analysis_workers(),
            cancel_wait_ms: default_cancel_wait_ms(),
            auto_save: false,
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: ExperimentConfig = serde_yaml_ng::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Load configuration with the following precedence:
    /// 1. Load from file if provided
    /// 2. Apply environment variable overrides
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Merge environment variables into this configuration.
    ///
    /// Only variables that are set override the current values.
    fn merge_env(mut self) -> Self {
        if let Ok(v) = std::env::var("ARVAK_EXPDATA_ANALYSIS_WORKERS") {
            if let Ok(val) = v.parse() {
                self.analysis_workers = val;
            }
        }
        if let Ok(v) = std::env::var("ARVAK_EXPDATA_CANCEL_WAIT_MS") {
            if let Ok(val) = v.parse() {
                self.cancel_wait_ms = val;
            }
        }
        if let Ok(v) = std::env::var("ARVAK_EXPDATA_AUTO_SAVE") {
            if let Ok(val) = v.parse() {
                self.auto_save = val;
            }
        }

        // Logging
        if let Ok(v) = std::env::var("ARVAK_EXPDATA_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("ARVAK_EXPDATA_LOG_FORMAT") {
            self.logging.format = v;
        }

        // Storage
        if let Ok(v) = std::env::var("ARVAK_EXPDATA_STORAGE") {
            self.storage.backend = v;
        }
        if let Ok(v) = std::env::var("ARVAK_EXPDATA_DIR") {
            self.storage.path = Some(PathBuf::from(v));
        }

        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis_workers == 0 {
            return Err(ConfigError::ValidationError(
                "analysis_workers must be greater than 0".to_string(),
            ));
        }

        match self.storage.backend.as_str() {
            "memory" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown storage backend: {other}"
                )));
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {other}"
                )));
            }
        }

        match self.logging.format.as_str() {
            "console" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {other}"
                )));
            }
        }

        Ok(())
    }

    /// Settle wait of `cancel_analysis`.
    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_ms)
    }

    /// Tracing configuration derived from the logging section.
    pub fn tracing(&self) -> TracingConfig {
        TracingConfig::new(
            self.logging.level.clone(),
            TracingFormat::parse(&self.logging.format),
        )
    }

    /// Construct the configured experiment service.
    pub async fn open_service(&self) -> ServiceResult<Arc<dyn ExperimentService>> {
        match self.storage.backend.as_str() {
            "json" => {
                let dir = self
                    .storage
                    .path
                    .clone()
                    .unwrap_or_else(JsonFileService::default_location);
                Ok(Arc::new(JsonFileService::new(dir).await?))
            }
            _ => Ok(Arc::new(MemoryService::new())),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExperimentConfig::default();
        assert_eq!(config.analysis_workers, 2);
        assert_eq!(config.cancel_wait(), Duration::from_secs(1));
        assert!(!config.auto_save);
        assert_eq!(config.storage.backend, "memory");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = ExperimentConfig {
            analysis_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_storage() {
        let mut config = ExperimentConfig::default();
        config.storage.backend = "postgres".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expdata.yaml");
        std::fs::write(
            &path,
            "cancel_wait_ms: 250\nstorage:\n  backend: json\n  path: /tmp/arvak-exp\nlogging:\n  format: json\n",
        )
        .unwrap();

        let config = ExperimentConfig::from_file(&path).unwrap();
        assert_eq!(config.cancel_wait_ms, 250);
        assert_eq!(config.analysis_workers, 2);
        assert_eq!(config.storage.backend, "json");
        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/arvak-exp")));
        assert_eq!(config.tracing().format, TracingFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[tokio::test]
    async fn test_open_json_service() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ExperimentConfig::default();
        config.storage.backend = "json".into();
        config.storage.path = Some(dir.path().join("store"));

        let service = config.open_service().await.unwrap();
        assert!(!service.options().auto_save);
        assert!(dir.path().join("store").join("experiments").is_dir());
    }
}
