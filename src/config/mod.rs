//! # Configuration
//!
//! Typed configuration for the resilience layer. Values come from
//! `config/resilience.toml`, an optional `config/resilience.{env}.toml`
//! overlay and `CAMPUS__*` environment variables, layered by
//! [`ConfigManager`].
//!
//! ```rust,no_run
//! use campus_core::config::ConfigManager;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! println!("broker enabled: {}", manager.config().dispatcher.broker_enabled);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::resilience::backoff::BackoffStrategy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breakers: CircuitBreakerSettings,
    pub jobs: JobSettings,
    pub runner: RunnerSettings,
    pub dispatcher: DispatcherSettings,
    pub database: DatabaseSettings,
}

impl ResilienceConfig {
    /// Validate cross-section invariants not covered by the policy registry
    pub fn validate(&self) -> ConfigResult<()> {
        self.runner.validate()?;
        self.dispatcher.validate()?;
        self.database.validate()?;
        Ok(())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// When false, breakers always admit calls and never trip
    pub enabled: bool,

    /// Partial policy overrides keyed by feature identifier (`AI_OCR`, ...)
    pub features: HashMap<String, FeaturePolicyOverride>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            features: HashMap::new(),
        }
    }
}

/// Partial override of a [`ResiliencePolicy`](crate::policy::ResiliencePolicy)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FeaturePolicyOverride {
    pub failure_threshold: Option<u32>,
    pub window_seconds: Option<u64>,
    pub open_duration_seconds: Option<u64>,
    pub half_open_max_calls: Option<u32>,
    pub fallback_message: Option<String>,
    pub fallback_data: Option<Value>,
    pub is_critical: Option<bool>,
}

/// Job policy configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct JobSettings {
    /// Partial policy overrides keyed by job type identifier (`ai_insight`, ...)
    pub types: HashMap<String, JobPolicyOverride>,
}

/// Partial override of a [`JobPolicy`](crate::policy::JobPolicy)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobPolicyOverride {
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub audit_action: Option<String>,
    pub backoff: Option<BackoffStrategy>,
}

/// How the runner treats errors that carry no explicit classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnclassifiedErrorPolicy {
    /// Treat as retryable
    #[default]
    Retry,
    /// Treat as permanent
    Fail,
}

/// Job runner settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub unclassified_errors: UnclassifiedErrorPolicy,

    /// Upper bound on a single audit sink call
    pub audit_timeout_ms: u64,
}

impl RunnerSettings {
    pub fn audit_timeout(&self) -> Duration {
        Duration::from_millis(self.audit_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.audit_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "runner.audit_timeout_ms",
                "0",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            unclassified_errors: UnclassifiedErrorPolicy::Retry,
            audit_timeout_ms: 2_000,
        }
    }
}

/// Dispatcher and in-process broker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Hand jobs to the broker instead of running them inline
    pub broker_enabled: bool,

    /// Bounded capacity of the in-process broker queue
    pub queue_capacity: usize,

    /// Jobs a broker worker runs concurrently
    pub worker_concurrency: usize,

    /// Default page size for `list_jobs`
    pub list_limit: u32,
}

impl DispatcherSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.queue_capacity",
                "0",
                "must be greater than 0",
            ));
        }
        if self.worker_concurrency == 0 || self.worker_concurrency > 256 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.worker_concurrency",
                self.worker_concurrency.to_string(),
                "must be between 1 and 256",
            ));
        }
        if self.list_limit == 0 || self.list_limit > 1_000 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.list_limit",
                self.list_limit.to_string(),
                "must be between 1 and 1000",
            ));
        }
        Ok(())
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            broker_enabled: false,
            queue_capacity: 1_024,
            worker_concurrency: 4,
            list_limit: 50,
        }
    }
}

/// Execution ledger storage settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// PostgreSQL URL; when absent the in-memory ledger is used
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        if let Some(url) = &self.url {
            if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                return Err(ConfigurationError::database_config_error(
                    "database.url must be a postgres:// or postgresql:// URL",
                ));
            }
        }
        if self.max_connections == 0 {
            return Err(ConfigurationError::database_config_error(
                "database.max_connections must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_seconds: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.circuit_breakers.enabled);
        assert!(!config.dispatcher.broker_enabled);
        assert_eq!(
            config.runner.unclassified_errors,
            UnclassifiedErrorPolicy::Retry
        );
    }

    #[test]
    fn test_invalid_sections_are_rejected() {
        let mut config = ResilienceConfig::default();
        config.dispatcher.worker_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.database.url = Some("mysql://localhost/campus".to_string());
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.runner.audit_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
