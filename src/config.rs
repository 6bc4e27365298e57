//! Scheduler configuration.
//!
//! Values come from an optional TOML file overlaid with `JOBCUTER_*`
//! environment variables. Double underscores separate nested keys:
//! `JOBCUTER_BREAKER__COOL_DOWN_MS` sets `breaker.cool_down_ms`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerSettings;
use crate::logging::LoggingConfig;
use crate::{JobcuterError, RetryPolicy};

const ENV_PREFIX: &str = "JOBCUTER";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {field} - {message}")]
    ValidationError { field: String, message: String },

    #[error("Configuration error: {0}")]
    Other(#[from] ::config::ConfigError),
}

impl ConfigError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<ConfigError> for JobcuterError {
    fn from(e: ConfigError) -> Self {
        JobcuterError::Config(e.to_string())
    }
}

/// Persistence service connection target. Opaque to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub redis_url: String,
    pub lease_ttl_ms: u64,
    pub key_prefix: String,
    pub pool_size: u32,
    pub connection_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            lease_ttl_ms: 5 * 60 * 1000,
            key_prefix: crate::lock::DEFAULT_KEY_PREFIX.to_string(),
            pool_size: 8,
            connection_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub max_requests_half_open: u32,
    pub rolling_interval_ms: u64,
    pub cool_down_ms: u64,
    pub consecutive_failure_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests_half_open: 1,
            rolling_interval_ms: 60_000,
            cool_down_ms: 30_000,
            consecutive_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub scan_interval_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_workers: usize,
    /// No limit on the job body when unset.
    pub execution_timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            execution_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_interval_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub breaker: BreakerConfig,
    pub resolver: ResolverConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl SchedulerConfig {
    /// Loads from the process environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None, None)
    }

    /// Loads `file` (if given) and overlays environment variables. When `env`
    /// is given it replaces the process environment as the variable source.
    pub fn load(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = Self::add_file_source(builder, path)?;
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR)
                .ignore_empty(true)
                .try_parsing(true)
                .source(env),
        );

        let settings: SchedulerConfig = builder.build()?.try_deserialize().map_err(|e| {
            ConfigError::ParseError(format!("Failed to deserialize configuration: {}", e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn add_file_source(
        builder: ConfigBuilder<DefaultState>,
        path: &Path,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let name = path
            .to_str()
            .ok_or_else(|| ConfigError::ParseError(format!("Non UTF-8 path: {}", path.display())))?;
        Ok(builder.add_source(File::new(name, FileFormat::Toml).required(true)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_workers == 0 {
            return Err(ConfigError::validation("executor.max_workers", "must be at least 1"));
        }
        if self.executor.execution_timeout_ms == Some(0) {
            return Err(ConfigError::validation(
                "executor.execution_timeout_ms",
                "must be positive when set",
            ));
        }
        if self.lock.lease_ttl_ms == 0 {
            return Err(ConfigError::validation("lock.lease_ttl_ms", "must be positive"));
        }
        if self.lock.pool_size == 0 {
            return Err(ConfigError::validation("lock.pool_size", "must be at least 1"));
        }
        if self.resolver.scan_interval_ms == 0 {
            return Err(ConfigError::validation("resolver.scan_interval_ms", "must be positive"));
        }
        if self.breaker.consecutive_failure_threshold == 0 {
            return Err(ConfigError::validation(
                "breaker.consecutive_failure_threshold",
                "must be at least 1",
            ));
        }
        if self.breaker.max_requests_half_open == 0 {
            return Err(ConfigError::validation(
                "breaker.max_requests_half_open",
                "must be at least 1",
            ));
        }
        if self.breaker.cool_down_ms == 0 {
            return Err(ConfigError::validation("breaker.cool_down_ms", "must be positive"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::validation("retry.multiplier", "must be at least 1.0"));
        }
        self.logging.validate()
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lock.lease_ttl_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.resolver.scan_interval_ms)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.executor.execution_timeout_ms.map(Duration::from_millis)
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            max_requests_half_open: self.breaker.max_requests_half_open,
            rolling_interval: Duration::from_millis(self.breaker.rolling_interval_ms),
            cool_down: Duration::from_millis(self.breaker.cool_down_ms),
            consecutive_failure_threshold: self.breaker.consecutive_failure_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.retry.interval_ms),
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            multiplier: self.retry.multiplier,
        }
        .normalized()
    }
}
