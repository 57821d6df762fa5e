//! Pipeline step identities and their dispatch targets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable name of a pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Export,
    CreateSchemas,
    Import,
    MigrateData,
    WarehouseExport,
    WarehouseLoad,
    BulkTag,
    WarehouseExportWithTags,
    WarehouseLoadWithTags,
}

impl StepName {
    pub const ALL: [StepName; 9] = [
        StepName::Export,
        StepName::CreateSchemas,
        StepName::Import,
        StepName::MigrateData,
        StepName::WarehouseExport,
        StepName::WarehouseLoad,
        StepName::BulkTag,
        StepName::WarehouseExportWithTags,
        StepName::WarehouseLoadWithTags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::CreateSchemas => "create_schemas",
            Self::Import => "import",
            Self::MigrateData => "migrate_data",
            Self::WarehouseExport => "warehouse_export",
            Self::WarehouseLoad => "warehouse_load",
            Self::BulkTag => "bulk_tag",
            Self::WarehouseExportWithTags => "warehouse_export_with_tags",
            Self::WarehouseLoadWithTags => "warehouse_load_with_tags",
        }
    }

    /// Endpoint, verb and queue the step is served from in a standard deployment
    pub fn default_node(self) -> StepNode {
        let (endpoint, method, queue) = match self {
            Self::Export => ("/syndication/export", HttpMethod::Post, QueueKind::Syndication),
            Self::CreateSchemas => (
                "/syndication/schemas_and_migration/create_all_schemas",
                HttpMethod::Post,
                QueueKind::Syndication,
            ),
            Self::Import => ("/syndication/import", HttpMethod::Post, QueueKind::Syndication),
            Self::MigrateData => (
                "/syndication/schemas_and_migration/migrate_all_data",
                HttpMethod::Post,
                QueueKind::Syndication,
            ),
            Self::WarehouseExport => (
                "/syndication/export_for_big_query",
                HttpMethod::Post,
                QueueKind::Syndication,
            ),
            Self::WarehouseLoad => (
                "/syndication/load_into_big_query",
                HttpMethod::Post,
                QueueKind::Syndication,
            ),
            Self::BulkTag => ("/tasks/tag/daily_bulk_tag", HttpMethod::Get, QueueKind::Tagging),
            Self::WarehouseExportWithTags => (
                "/syndication/export_for_big_query_with_tags",
                HttpMethod::Post,
                QueueKind::Syndication,
            ),
            Self::WarehouseLoadWithTags => (
                "/syndication/load_into_big_query_with_tags",
                HttpMethod::Post,
                QueueKind::Syndication,
            ),
        };
        StepNode::new(self, queue, endpoint, method)
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepName::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("Unknown step name: {s}"))
    }
}

/// HTTP verb the continuation queue uses to invoke a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Logical queue a step lives on; resolved to a queue id through configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Syndication,
    Tagging,
}

/// Immutable description of one node in the pipeline chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepNode {
    pub name: StepName,
    pub queue: QueueKind,
    pub endpoint: String,
    pub method: HttpMethod,
}

impl StepNode {
    pub fn new(name: StepName, queue: QueueKind, endpoint: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            name,
            queue,
            endpoint: endpoint.into(),
            method,
        }
    }
}
