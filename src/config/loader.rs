//! Configuration Loader
//!
//! Environment-aware configuration loading. Layers the base TOML file, an
//! optional environment overlay and `CAMPUS__` prefixed environment variables,
//! then validates the result together with the derived policy registry.

use super::error::{ConfigResult, ConfigurationError};
use super::ResilienceConfig;
use crate::policy::PolicyRegistry;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE: &str = "resilience.toml";
const ENV_PREFIX: &str = "CAMPUS";

/// Loaded, validated configuration plus the policy registry derived from it
#[derive(Debug)]
pub struct ConfigManager {
    config: ResilienceConfig,
    policies: PolicyRegistry,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    ///
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        if !config_directory.is_dir() {
            return Err(ConfigurationError::directory_not_found(config_directory));
        }

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading resilience configuration"
        );

        let config = Self::load_layers(&config_directory, environment)?;
        let manager = Self::from_config(config, environment)?;

        info!(
            environment = environment,
            broker_enabled = manager.config.dispatcher.broker_enabled,
            circuit_breakers_enabled = manager.config.circuit_breakers.enabled,
            ledger = if manager.config.database.url.is_some() { "postgres" } else { "memory" },
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config_directory,
            ..manager
        }))
    }

    /// Build a manager from an in-memory configuration document
    pub fn from_config(config: ResilienceConfig, environment: &str) -> ConfigResult<ConfigManager> {
        config.validate()?;
        let policies = PolicyRegistry::from_config(&config)?;

        Ok(ConfigManager {
            config,
            policies,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        })
    }

    fn load_layers(directory: &Path, environment: &str) -> ConfigResult<ResilienceConfig> {
        let base_path = directory.join(BASE_FILE);
        let overlay_path = directory.join(format!("resilience.{environment}.toml"));

        let layered = Config::builder()
            .add_source(File::from(base_path).required(false))
            .add_source(File::from(overlay_path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        layered
            .try_deserialize::<ResilienceConfig>()
            .map_err(|e| ConfigurationError::load_error(environment, e))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Get the validated policy registry
    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with credentials masked, for logs and diagnostics
    pub fn debug_config(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null);
        if let Some(url) = value
            .pointer_mut("/database/url")
            .filter(|url| url.is_string())
        {
            let masked = url.as_str().map(mask_database_url).unwrap_or_default();
            *url = serde_json::Value::String(masked);
        }
        value
    }

    /// Current environment from `CAMPUS_ENV`, then `APP_ENV`
    pub fn detect_environment() -> String {
        env::var("CAMPUS_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("CAMPUS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}

/// Replace the password component of a database URL
fn mask_database_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnclassifiedErrorPolicy;
    use crate::resilience::Feature;
    use std::fs;

    #[test]
    fn test_load_layers_base_and_environment_overlay() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("resilience.toml"),
            r#"
[circuit_breakers.features.AI_OCR]
failure_threshold = 7

[dispatcher]
worker_concurrency = 2
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("resilience.staging.toml"),
            r#"
[runner]
unclassified_errors = "fail"

[dispatcher]
broker_enabled = true
"#,
        )
        .unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "staging")
                .unwrap();

        assert_eq!(manager.environment(), "staging");
        assert!(manager.config().dispatcher.broker_enabled);
        assert_eq!(manager.config().dispatcher.worker_concurrency, 2);
        assert_eq!(
            manager.config().runner.unclassified_errors,
            UnclassifiedErrorPolicy::Fail
        );
        assert_eq!(
            manager.policies().feature_policy(Feature::AiOcr).failure_threshold,
            7
        );
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let result = ConfigManager::load_from_directory_with_env(
            Some(PathBuf::from("/definitely/not/here")),
            "test",
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::DirectoryNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_policy_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("resilience.toml"),
            r#"
[circuit_breakers.features.PAYMENT_GATEWAY]
half_open_max_calls = 0
"#,
        )
        .unwrap();

        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_debug_config_masks_password() {
        let mut config = ResilienceConfig::default();
        config.database.url = Some("postgresql://campus:s3cret@db:5432/campus".to_string());
        let manager = ConfigManager::from_config(config, "test").unwrap();

        let debug = manager.debug_config();
        assert_eq!(
            debug["database"]["url"],
            "postgresql://campus:***@db:5432/campus"
        );
    }
}
