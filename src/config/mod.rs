//! # Syndication Configuration
//!
//! Environment-provided settings for one deployment of the syndication
//! pipeline: which source environments feed it, what the target is called,
//! where the continuation queues live, and how the shared ID space is laid
//! out. None of it is part of the algorithm itself; handlers read it to
//! resolve names and limits.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use syndication_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let sources = manager.config().syndication.active_source_environments();
//! println!("syndicating from {sources:?}");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::{dispatch, id_space, NO_SOURCE_ENVIRONMENT_SENTINEL};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SyndicationConfig {
    /// Deployment environment name (development, test, production)
    pub environment: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gcp: GcpConfig,
    pub syndication: SyndicationSettings,
    pub queues: QueueConfig,
    pub deferral: DeferralConfig,
    pub id_space: IdSpaceConfig,
    pub warehouse: WarehouseConfig,
    pub notifications: NotificationConfig,
    pub tagging: TaggingConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Bulk tagging requests can run for several minutes
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 600_000,
        }
    }
}

/// Target database connection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/kujakuja_development".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 30,
        }
    }
}

/// Cloud project hosting the target environment
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GcpConfig {
    pub project: String,
    pub location: String,
    /// App Engine service the continuation queue routes requests to
    pub app_engine_service: String,
    /// Static bearer token; when absent the metadata server is asked for one
    pub access_token: Option<String>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            location: "us-central1".to_string(),
            app_engine_service: "api".to_string(),
            access_token: None,
        }
    }
}

/// One row of the per-environment service type translation table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceTypeMapping {
    pub source_env: String,
    pub source_service_type_id: i64,
    pub source_service_type_name: String,
    pub target_service_type_id: i64,
    pub target_service_type_name: String,
}

/// Source/target topology and naming conventions
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyndicationSettings {
    pub source_environments: Vec<String>,
    pub target_environment: String,
    /// Deployment tier suffix, e.g. "prod" or "staging"
    pub environment_type: String,
    /// `{target}` and `{env_type}` are substituted
    pub bucket_name_template: String,
    /// `{source}` and `{env_type}` are substituted
    pub source_project_template: String,
    /// All source instances live in this project instead of their own
    pub source_project_override: Option<String>,
    /// Target instance lives in this project instead of `gcp.project`
    pub target_project_override: Option<String>,
    pub default_database_name: String,
    pub source_database_overrides: HashMap<String, String>,
    pub target_database_name: Option<String>,
    /// Grant the target instance read access on each imported object
    pub grant_object_readers: bool,
    /// Role owning the staging schemas, e.g. `cloudsqlsuperuser`
    pub staging_schema_owner: Option<String>,
    pub service_type_mappings: Vec<ServiceTypeMapping>,
}

impl Default for SyndicationSettings {
    fn default() -> Self {
        Self {
            source_environments: Vec::new(),
            target_environment: String::new(),
            environment_type: "prod".to_string(),
            bucket_name_template: "kujakuja-{target}-{env_type}-syndication".to_string(),
            source_project_template: "kujakuja-{source}-{env_type}".to_string(),
            source_project_override: None,
            target_project_override: None,
            default_database_name: "kujakuja".to_string(),
            source_database_overrides: HashMap::new(),
            target_database_name: None,
            grant_object_readers: true,
            staging_schema_owner: None,
            service_type_mappings: Vec::new(),
        }
    }
}

impl SyndicationSettings {
    /// Source environments in processing order, with blanks and the
    /// "no sources" sentinel removed.
    pub fn active_source_environments(&self) -> Vec<String> {
        self.source_environments
            .iter()
            .map(|env| env.trim())
            .filter(|env| !env.is_empty() && *env != NO_SOURCE_ENVIRONMENT_SENTINEL)
            .map(str::to_string)
            .collect()
    }

    pub fn has_source_environments(&self) -> bool {
        !self.active_source_environments().is_empty()
    }

    /// Service type mappings that apply to one source environment
    pub fn mappings_for(&self, source_env: &str) -> Vec<&ServiceTypeMapping> {
        self.service_type_mappings
            .iter()
            .filter(|mapping| mapping.source_env == source_env)
            .collect()
    }
}

/// Continuation queue identifiers
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub syndication_queue_id: String,
    pub tagging_queue_id: String,
    pub default_delay_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            syndication_queue_id: "syndication".to_string(),
            tagging_queue_id: "tagging".to_string(),
            default_delay_seconds: dispatch::DEFAULT_DELAY_SECONDS,
        }
    }
}

/// Backoff applied while a step waits on an async backend operation
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeferralConfig {
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub multiplier: f64,
    pub max_delay_seconds: u64,
    /// 0.0 disables jitter
    pub jitter_factor: f64,
}

impl Default for DeferralConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            base_delay_seconds: dispatch::DEFAULT_DELAY_SECONDS,
            multiplier: 1.5,
            max_delay_seconds: 600,
            jitter_factor: 0.1,
        }
    }
}

/// Shared ID-space layout
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdSpaceConfig {
    pub base_offset: i64,
    pub increment: i64,
    pub local_threshold: i64,
}

impl Default for IdSpaceConfig {
    fn default() -> Self {
        Self {
            base_offset: id_space::DEFAULT_BASE_OFFSET,
            increment: id_space::DEFAULT_OFFSET_INCREMENT,
            local_threshold: id_space::LOCAL_ID_THRESHOLD,
        }
    }
}

/// Analytical warehouse naming
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub dataset_id: String,
    pub location: String,
    pub table_prefix: String,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            dataset_id: "kujakuja".to_string(),
            location: "US".to_string(),
            table_prefix: "kk_".to_string(),
        }
    }
}

/// Progress notification channel
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub slack_token: Option<String>,
    pub channel_id: String,
    pub api_base_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slack_token: None,
            channel_id: String::new(),
            api_base_url: "https://slack.com/api".to_string(),
        }
    }
}

/// Bulk tagging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaggingConfig {
    /// Language of free-text ideas; selects the full-text search dictionary
    pub ideas_language: String,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            ideas_language: "en".to_string(),
        }
    }
}

impl TaggingConfig {
    pub fn ts_vector_language(&self) -> &'static str {
        match self.ideas_language.trim().to_lowercase().as_str() {
            "es" => "pg_catalog.spanish",
            "fr" => "pg_catalog.french",
            _ => "pg_catalog.english",
        }
    }
}

impl SyndicationConfig {
    /// Validate cross-field invariants after loading
    pub fn validate(&self) -> ConfigResult<()> {
        if self.syndication.target_environment.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "target_environment",
                "syndication",
            ));
        }

        let mut seen = HashSet::new();
        for env in self.syndication.active_source_environments() {
            if !seen.insert(env.clone()) {
                return Err(ConfigurationError::invalid_value(
                    "source_environments",
                    env,
                    "source environments must be unique",
                ));
            }
        }

        if self.id_space.increment <= 0 {
            return Err(ConfigurationError::invalid_value(
                "id_space.increment",
                self.id_space.increment.to_string(),
                "increment must be positive",
            ));
        }

        if self.id_space.base_offset < self.id_space.local_threshold {
            return Err(ConfigurationError::invalid_value(
                "id_space.base_offset",
                self.id_space.base_offset.to_string(),
                "base offset must not overlap locally created rows",
            ));
        }

        if self.id_space.increment < self.id_space.local_threshold {
            return Err(ConfigurationError::invalid_value(
                "id_space.increment",
                self.id_space.increment.to_string(),
                "increment must be able to hold every local row of one environment",
            ));
        }

        if self.deferral.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "deferral.max_attempts",
                "0",
                "at least one attempt is required",
            ));
        }

        if self.deferral.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "deferral.multiplier",
                self.deferral.multiplier.to_string(),
                "multiplier must be at least 1.0",
            ));
        }

        if self.notifications.enabled && self.notifications.channel_id.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "channel_id",
                "notifications",
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    /// Test deployments never reach external services
    pub fn is_test_environment(&self) -> bool {
        self.environment == "test"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> SyndicationConfig {
        let mut config = SyndicationConfig::default();
        config.syndication.target_environment = "ofda".to_string();
        config.syndication.source_environments = vec!["crc".to_string(), "nrc".to_string()];
        config
    }

    #[test]
    fn test_valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_target_environment_is_rejected() {
        let mut config = valid_config();
        config.syndication.target_environment = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingRequiredField { .. })
        ));
    }

    #[test]
    fn test_duplicate_source_environments_are_rejected() {
        let mut config = valid_config();
        config.syndication.source_environments =
            vec!["crc".to_string(), "nrc".to_string(), "crc".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_offset_must_clear_local_rows() {
        let mut config = valid_config();
        config.id_space.base_offset = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sentinel_means_no_sources() {
        let mut settings = SyndicationSettings::default();
        settings.source_environments = vec!["None".to_string()];
        assert!(!settings.has_source_environments());

        settings.source_environments = vec![" crc ".to_string(), String::new()];
        assert_eq!(settings.active_source_environments(), vec!["crc".to_string()]);
    }

    #[test]
    fn test_ts_vector_language_selection() {
        let mut tagging = TaggingConfig::default();
        assert_eq!(tagging.ts_vector_language(), "pg_catalog.english");
        tagging.ideas_language = " ES ".to_string();
        assert_eq!(tagging.ts_vector_language(), "pg_catalog.spanish");
        tagging.ideas_language = "fr".to_string();
        assert_eq!(tagging.ts_vector_language(), "pg_catalog.french");
    }

    #[test]
    fn test_mappings_filtered_by_environment() {
        let mut settings = SyndicationSettings::default();
        settings.service_type_mappings = vec![
            ServiceTypeMapping {
                source_env: "crc".to_string(),
                source_service_type_id: 1,
                source_service_type_name: "Nutrition".to_string(),
                target_service_type_id: 6,
                target_service_type_name: "Nutrition".to_string(),
            },
            ServiceTypeMapping {
                source_env: "nrc".to_string(),
                source_service_type_id: 3,
                source_service_type_name: "Cash Transfer".to_string(),
                target_service_type_id: 9,
                target_service_type_name: "Cash Transfer".to_string(),
            },
        ];
        let crc = settings.mappings_for("crc");
        assert_eq!(crc.len(), 1);
        assert_eq!(crc[0].target_service_type_id, 6);
    }
}
