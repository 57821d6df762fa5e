//! # Cloud Capabilities
//!
//! Contracts for the managed services the pipeline drives: the SQL admin API
//! that runs long export/import operations, object storage for the CSV files
//! moving between environments, and the analytical warehouse. Handlers only
//! see these traits; [`google`] holds the REST implementations and
//! `test_helpers` the in-memory ones.

pub mod auth;
pub mod google;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use auth::{MetadataServerTokenSource, StaticTokenSource, TokenSource};
pub use google::{BigQueryWarehouse, CloudSqlAdmin, CloudStorage, GoogleApiClient};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{service} request failed: {message}")]
    Transport { service: String, message: String },

    #[error("{service} returned HTTP {status}: {message}")]
    Http {
        service: String,
        status: u16,
        message: String,
    },

    #[error("{service} response could not be parsed: {message}")]
    InvalidResponse { service: String, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No SQL instance found in project {project}")]
    NoInstance { project: String },
}

impl CloudError {
    pub fn transport(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn invalid_response(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// The managed SQL instance serving one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetails {
    pub project: String,
    pub instance: String,
    pub service_account_email: String,
}

/// CSV export of one query result to object storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvExportRequest {
    pub uri: String,
    pub database: String,
    pub tables: Vec<String>,
    pub select_query: String,
}

/// CSV import of one object into one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvImportRequest {
    pub uri: String,
    pub database: String,
    /// Schema-qualified target table, e.g. `"crc".countries`
    pub table: String,
}

/// Column of a warehouse table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

impl WarehouseField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
        }
    }
}

/// Truncating CSV load into a warehouse table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseLoadRequest {
    pub project: String,
    pub dataset_id: String,
    pub table_id: String,
    pub source_uri: String,
    pub schema: Vec<WarehouseField>,
    pub location: String,
}

/// Managed SQL administration with long-running operations
#[async_trait]
pub trait SqlAdmin: Send + Sync {
    /// First instance of the project; each environment runs exactly one
    async fn instance_details(&self, project: &str) -> CloudResult<InstanceDetails>;

    /// True when the instance has no operation in flight
    async fn most_recent_operation_done(&self, project: &str, instance: &str) -> CloudResult<bool>;

    async fn start_export(&self, project: &str, instance: &str, request: &CsvExportRequest) -> CloudResult<()>;

    async fn start_import(&self, project: &str, instance: &str, request: &CsvImportRequest) -> CloudResult<()>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create the bucket if it does not exist yet
    async fn ensure_bucket(&self, project: &str, bucket: &str, location: &str) -> CloudResult<()>;

    /// Idempotently give `email` the WRITER role on the bucket
    async fn grant_bucket_writer(&self, bucket: &str, email: &str) -> CloudResult<()>;

    /// Idempotently give `email` the READER role on one object
    async fn grant_object_reader(&self, bucket: &str, object: &str, email: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn ensure_dataset(&self, project: &str, dataset_id: &str, location: &str) -> CloudResult<()>;

    async fn ensure_table(
        &self,
        project: &str,
        dataset_id: &str,
        table_id: &str,
        schema: &[WarehouseField],
        location: &str,
    ) -> CloudResult<()>;

    /// Start a load job replacing the table contents; returns the job id
    async fn load_csv(&self, request: &WarehouseLoadRequest) -> CloudResult<String>;
}
