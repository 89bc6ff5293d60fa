//! Process configuration loaded from TOML.
//!
//! The file path comes from `CONFIG_PATH` (default `configs/app.toml`). A
//! missing file yields defaults; a file that exists but does not parse is an
//! error. Every section is optional.

use crate::engine::{DependencyMode, EngineConfig};
use crate::registry::TaskRegistry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use txcore::{RetryPolicy, RetryStrategy, TaskDefinition, MAX_RETRY_INTERVAL_SECS};

pub const DEFAULT_CONFIG_PATH: &str = "configs/app.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub retry: RetryConfig,
    pub engine: EngineSection,
    /// Pool for the `db` task executor
    pub database: Option<DatabaseConfig>,
    /// Persistent repository store; state stays in memory when absent
    pub store: Option<DatabaseConfig>,
    pub broker: Option<BrokerConfig>,
    /// Extra or overriding task definitions
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    pub level: String,
    /// `json` for structured output, anything else for human-readable
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub scan_interval_secs: u64,
    pub default_max_attempts: u32,
    pub default_interval_secs: u64,
    pub default_strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            scan_interval_secs: 10,
            default_max_attempts: policy.max_attempts,
            default_interval_secs: policy.interval_secs,
            default_strategy: policy.strategy,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub dependency_mode: DependencyMode,
    pub retry_with_node_config: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub connection_string: String,
    #[serde(default = "default_broker_user")]
    pub username: String,
    #[serde(default = "default_broker_user")]
    pub password: String,
    #[serde(default = "default_stream")]
    pub stream: String,
}

fn default_broker_user() -> String {
    "iggy".to_string()
}

fn default_stream() -> String {
    "txflow".to_string()
}

impl AppConfig {
    /// Load from `CONFIG_PATH`, or the default path when unset
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config found at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: AppConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.scan_interval_secs == 0 {
            return Err(ConfigError::Invalid("retry.scan_interval_secs must be positive".to_string()));
        }
        if self.retry.default_max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.default_max_attempts must be positive".to_string()));
        }
        if self.retry.default_interval_secs > MAX_RETRY_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "retry.default_interval_secs must not exceed {}",
                MAX_RETRY_INTERVAL_SECS
            )));
        }
        if let Some(db) = &self.database {
            if db.url.is_empty() {
                return Err(ConfigError::Invalid("database.url must not be empty".to_string()));
            }
        }
        if let Some(store) = &self.store {
            if store.url.is_empty() {
                return Err(ConfigError::Invalid("store.url must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// `BIND_ADDRESS` if set, else `server.host:server.port`
    pub fn bind_address(&self) -> String {
        std::env::var("BIND_ADDRESS")
            .unwrap_or_else(|_| format!("{}:{}", self.server.host, self.server.port))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.retry.scan_interval_secs)
    }

    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            strategy: self.retry.default_strategy,
            max_attempts: self.retry.default_max_attempts,
            interval_secs: self.retry.default_interval_secs,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            dependency_mode: self.engine.dependency_mode,
            default_retry: self.default_retry_policy(),
            retry_with_node_config: self.engine.retry_with_node_config,
        }
    }

    /// Built-in definitions plus `[[tasks]]`, the latter winning on name
    pub fn registry(&self) -> TaskRegistry {
        let mut registry = TaskRegistry::with_builtins();
        for definition in &self.tasks {
            registry.register(definition.clone());
        }
        registry
    }
}
