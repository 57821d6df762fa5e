//! Naming conventions of one syndication deployment.
//!
//! Every cloud resource the pipeline touches is derived from the target
//! environment, the environment type and a source environment name. Keeping
//! the derivations together means handlers never format resource names
//! themselves.

use crate::config::{SyndicationConfig, SyndicationSettings, WarehouseConfig};

#[derive(Debug, Clone)]
pub struct SyndicationNaming {
    settings: SyndicationSettings,
    warehouse: WarehouseConfig,
    gcp_project: String,
}

impl SyndicationNaming {
    pub fn new(config: &SyndicationConfig) -> Self {
        Self {
            settings: config.syndication.clone(),
            warehouse: config.warehouse.clone(),
            gcp_project: config.gcp.project.clone(),
        }
    }

    pub fn target_environment(&self) -> &str {
        &self.settings.target_environment
    }

    pub fn environment_type(&self) -> &str {
        &self.settings.environment_type
    }

    /// Bucket in the target project receiving every CSV file
    pub fn bucket(&self) -> String {
        self.settings
            .bucket_name_template
            .replace("{target}", &self.settings.target_environment)
            .replace("{env_type}", &self.settings.environment_type)
    }

    pub fn source_project(&self, source_env: &str) -> String {
        match &self.settings.source_project_override {
            Some(project) => project.clone(),
            None => self
                .settings
                .source_project_template
                .replace("{source}", source_env)
                .replace("{env_type}", &self.settings.environment_type),
        }
    }

    pub fn target_project(&self) -> String {
        self.settings
            .target_project_override
            .clone()
            .unwrap_or_else(|| self.gcp_project.clone())
    }

    pub fn source_database(&self, source_env: &str) -> String {
        self.settings
            .source_database_overrides
            .get(source_env)
            .cloned()
            .unwrap_or_else(|| self.settings.default_database_name.clone())
    }

    pub fn target_database(&self) -> String {
        self.settings
            .target_database_name
            .clone()
            .unwrap_or_else(|| self.settings.default_database_name.clone())
    }

    /// Object holding one exported table, e.g. `crc-prod-countries.csv`
    pub fn export_object(&self, source_env: &str, table: &str) -> String {
        format!("{source_env}-{}-{table}.csv", self.settings.environment_type)
    }

    pub fn object_uri(&self, object: &str) -> String {
        format!("gs://{}/{object}", self.bucket())
    }

    /// Staging table an environment's export is imported into
    pub fn staging_table(&self, source_env: &str, table: &str) -> String {
        format!("{}.{table}", quote_ident(source_env))
    }

    /// Object holding the denormalised responses of the target
    pub fn warehouse_object(&self, with_tags: bool) -> String {
        let suffix = if with_tags { "-w-tags" } else { "" };
        format!(
            "{}-{}-responses{suffix}.csv",
            self.settings.target_environment, self.settings.environment_type
        )
    }

    /// Warehouse table; characters outside `[A-Za-z0-9_]` become `_`
    pub fn warehouse_table(&self, with_tags: bool) -> String {
        let target: String = self
            .settings
            .target_environment
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let suffix = if with_tags { "_w_tags" } else { "" };
        format!("{}{target}_daily{suffix}", self.warehouse.table_prefix)
    }

    pub fn warehouse_dataset(&self) -> &str {
        &self.warehouse.dataset_id
    }

    pub fn warehouse_location(&self) -> &str {
        &self.warehouse.location
    }
}

/// Quote a Postgres identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
