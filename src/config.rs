use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use llm_host_models::{ModelSettings, SessionConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::engine::EngineOptions;
use crate::scheduler::DEFAULT_WORKER_NAME_PREFIX;

static INIT_TRACING: Once = Once::new();

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("prediction.send_poll_interval_ms must be positive")]
    ZeroPollInterval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub preflight_model_file: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionSection {
    pub worker_name_prefix: String,
    pub send_poll_interval_ms: u64,
}

impl Default for PredictionSection {
    fn default() -> Self {
        Self {
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_string(),
            send_poll_interval_ms: 10,
        }
    }
}

impl PredictionSection {
    pub fn send_poll_interval(&self) -> Duration {
        Duration::from_millis(self.send_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub logging: LoggingConfig,
    pub engine: EngineSection,
    pub prediction: PredictionSection,
    /// Model loaded by the demo binary.
    pub model: Option<ModelSettings>,
    /// Session configuration used by the demo binary.
    pub session: Option<SessionConfig>,
}

impl HostConfig {
    /// Loads a config file; `.json` is read as JSON, anything else as TOML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("toml");

        let config: Self = match extension {
            "json" => serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?,
            _ => toml::from_str(&contents).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Like [`Self::from_file`], but a missing path yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.prediction.send_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            preflight_model_file: self.engine.preflight_model_file,
        }
    }
}

/// Installs the global fmt subscriber once. `RUST_LOG` wins over the
/// configured level. Later calls, or an already installed subscriber, are
/// left alone.
pub fn init_tracing(logging: &LoggingConfig) {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&logging.level));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        tracing::debug!(level = %logging.level, "tracing initialized");
    });
}
