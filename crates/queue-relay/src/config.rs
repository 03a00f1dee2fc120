//! Runtime configuration.
//!
//! Sources, later ones overriding earlier ones:
//!  1. `config/queue-relay.yaml`, if present
//!  2. an explicit file passed to [`RuntimeConfig::load`], which must exist
//!  3. environment variables prefixed `QR__` with `__` separators,
//!     e.g. `QR__PUMP__MAX_BATCH_SIZE=25` sets `pump.max_batch_size`
//!
//! Every field has a default, so an empty environment yields a valid
//! configuration. A malformed file or a value of the wrong type is an error.

use crate::pump::PumpConfig;
use crate::relay::RelayConfig;
use crate::retry::RetryPolicy;
use crate::sessions::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const DEFAULT_CONFIG_FILE: &str = "config/queue-relay";
const ENV_PREFIX: &str = "QR";
const ENV_SEPARATOR: &str = "__";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration value for '{field}': {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: &str) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

/// Retry settings for broker calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 16_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
        );
        if self.use_jitter {
            policy
        } else {
            policy.without_jitter()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Dead-letter remediation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    pub max_batch_size: usize,
    pub receive_timeout_ms: u64,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            receive_timeout_ms: 1_000,
        }
    }
}

impl RemediationConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pump: PumpConfig,
    pub sessions: SessionConfig,
    pub relay: RelayConfig,
    pub remediation: RemediationConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load from the default file, `explicit_path` and the environment, then validate
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_environment(
            explicit_path,
            ::config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR),
        )
    }

    pub(crate) fn load_with_environment(
        explicit_path: Option<&Path>,
        environment: ::config::Environment,
    ) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder().add_source(
            ::config::File::with_name(DEFAULT_CONFIG_FILE)
                .required(false)
                .format(::config::FileFormat::Yaml),
        );

        if let Some(path) = explicit_path {
            info!(path = %path.display(), "Loading configuration from explicit path");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pump.max_concurrent_calls == 0 {
            return Err(ConfigError::invalid("pump.max_concurrent_calls", "must be at least 1"));
        }
        if self.pump.max_batch_size == 0 {
            return Err(ConfigError::invalid("pump.max_batch_size", "must be at least 1"));
        }
        if self.pump.max_delivery_count == Some(0) {
            return Err(ConfigError::invalid("pump.max_delivery_count", "must be at least 1"));
        }
        if self.sessions.max_batch_size == 0 {
            return Err(ConfigError::invalid("sessions.max_batch_size", "must be at least 1"));
        }
        if self.remediation.max_batch_size == 0 {
            return Err(ConfigError::invalid("remediation.max_batch_size", "must be at least 1"));
        }
        if self.relay.initial_backoff_ms == 0 {
            return Err(ConfigError::invalid("relay.initial_backoff_ms", "must be greater than 0"));
        }
        if self.relay.initial_backoff_ms > self.relay.max_backoff_ms {
            return Err(ConfigError::invalid(
                "relay.max_backoff_ms",
                "must not be less than relay.initial_backoff_ms",
            ));
        }
        if self.relay.store_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("relay.store_path", "must not be empty"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "must not be less than retry.initial_delay_ms",
            ));
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level", "must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
