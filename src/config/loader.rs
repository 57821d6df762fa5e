//! Configuration Loader
//!
//! Environment-aware configuration loading. Layers, lowest precedence first:
//! built-in defaults, `config/syndication.toml`, `config/syndication.{env}.toml`,
//! then `SYNDICATION__*` environment variables (`__` separates nesting levels,
//! e.g. `SYNDICATION__SYNDICATION__TARGET_ENVIRONMENT=ofda`).

use super::error::{ConfigResult, ConfigurationError};
use super::SyndicationConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_STEM: &str = "syndication";
const ENV_PREFIX: &str = "SYNDICATION";

/// Loaded configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: SyndicationConfig,
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

    /// Load configuration from a specific directory with explicit environment.
    /// Useful in tests that should not depend on process-wide variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let mut config = Self::build(&config_directory, environment)?;
        config.environment = environment.to_string();
        config.validate()?;

        debug!(
            "Configuration loaded: {}",
            serde_json::to_string(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = %environment,
            target_environment = %config.syndication.target_environment,
            source_environments = ?config.syndication.active_source_environments(),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: SyndicationConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        let environment = config.environment.clone();
        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_directory: PathBuf::from("config"),
        }))
    }

    fn build(config_directory: &Path, environment: &str) -> ConfigResult<SyndicationConfig> {
        let base = config_directory.join(CONFIG_FILE_STEM);
        let overrides = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}"));

        let settings = Config::builder()
            .add_source(File::from(base).required(false))
            .add_source(File::from(overrides).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("syndication.source_environments")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::LoadError {
                environment: environment.to_string(),
                error: e.to_string(),
            })?;

        settings
            .try_deserialize::<SyndicationConfig>()
            .map_err(|e| ConfigurationError::LoadError {
                environment: environment.to_string(),
                error: e.to_string(),
            })
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &SyndicationConfig {
        &self.config
    }

    /// Configuration as JSON with secrets masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// SYNDICATION_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        env::var("SYNDICATION_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn sanitize_config_for_logging(config: &SyndicationConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        let sensitive_patterns = ["password", "secret", "token", "credential", "url"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);
        config_json
    }

    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if is_sensitive && !val.is_null() && !val.is_object() {
                        *val = serde_json::Value::String("[MASKED]".to_string());
                    } else {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                    }
                }
            }
            serde_json::Value::Array(arr) => {
                for item in arr.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).expect("write config file");
    }

    const BASE_CONFIG: &str = r#"
[syndication]
target_environment = "ofda"
source_environments = ["crc", "nrc"]
environment_type = "prod"

[[syndication.service_type_mappings]]
source_env = "crc"
source_service_type_id = 1
source_service_type_name = "Nutrition"
target_service_type_id = 6
target_service_type_name = "Nutrition"

[queues]
syndication_queue_id = "syndication-queue"

[notifications]
enabled = false
slack_token = "xoxb-secret"
"#;

    #[test]
    #[serial]
    fn test_base_file_is_loaded() {
        let temp = TempDir::new().expect("temp dir");
        write_config(temp.path(), "syndication.toml", BASE_CONFIG);

        let manager =
            ConfigManager::load_from_directory_with_env(Some(temp.path().to_path_buf()), "test")
                .expect("config loads");
        let config = manager.config();

        assert_eq!(manager.environment(), "test");
        assert_eq!(config.syndication.target_environment, "ofda");
        assert_eq!(
            config.syndication.active_source_environments(),
            vec!["crc".to_string(), "nrc".to_string()]
        );
        assert_eq!(config.queues.syndication_queue_id, "syndication-queue");
        assert_eq!(config.queues.tagging_queue_id, "tagging");
        assert_eq!(config.syndication.service_type_mappings.len(), 1);
    }

    #[test]
    #[serial]
    fn test_environment_file_overrides_base() {
        let temp = TempDir::new().expect("temp dir");
        write_config(temp.path(), "syndication.toml", BASE_CONFIG);
        write_config(
            temp.path(),
            "syndication.test.toml",
            "[syndication]\nsource_environments = [\"None\"]\n",
        );

        let manager =
            ConfigManager::load_from_directory_with_env(Some(temp.path().to_path_buf()), "test")
                .expect("config loads");

        assert!(!manager.config().syndication.has_source_environments());
        assert_eq!(manager.config().syndication.target_environment, "ofda");
    }

    #[test]
    #[serial]
    fn test_environment_variables_override_files() {
        let temp = TempDir::new().expect("temp dir");
        write_config(temp.path(), "syndication.toml", BASE_CONFIG);

        env::set_var("SYNDICATION__SYNDICATION__SOURCE_ENVIRONMENTS", "wfp,unhcr");
        env::set_var("SYNDICATION__QUEUES__DEFAULT_DELAY_SECONDS", "5");
        let result =
            ConfigManager::load_from_directory_with_env(Some(temp.path().to_path_buf()), "test");
        env::remove_var("SYNDICATION__SYNDICATION__SOURCE_ENVIRONMENTS");
        env::remove_var("SYNDICATION__QUEUES__DEFAULT_DELAY_SECONDS");

        let manager = result.expect("config loads");
        assert_eq!(
            manager.config().syndication.active_source_environments(),
            vec!["wfp".to_string(), "unhcr".to_string()]
        );
        assert_eq!(manager.config().queues.default_delay_seconds, 5);
    }

    #[test]
    #[serial]
    fn test_missing_target_fails_validation() {
        let temp = TempDir::new().expect("temp dir");
        write_config(
            temp.path(),
            "syndication.toml",
            "[syndication]\nsource_environments = [\"crc\"]\n",
        );

        let result =
            ConfigManager::load_from_directory_with_env(Some(temp.path().to_path_buf()), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::MissingRequiredField { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_environment_detection() {
        env::set_var("SYNDICATION_ENV", "Production");
        assert_eq!(ConfigManager::detect_environment(), "production");
        env::remove_var("SYNDICATION_ENV");
    }

    #[test]
    #[serial]
    fn test_config_sanitization() {
        let temp = TempDir::new().expect("temp dir");
        write_config(temp.path(), "syndication.toml", BASE_CONFIG);

        let manager =
            ConfigManager::load_from_directory_with_env(Some(temp.path().to_path_buf()), "test")
                .expect("config loads");
        let sanitized = manager.debug_config();

        assert_eq!(sanitized["notifications"]["slack_token"], "[MASKED]");
        assert_eq!(sanitized["database"]["url"], "[MASKED]");
        assert_eq!(sanitized["syndication"]["target_environment"], "ofda");
    }
}
