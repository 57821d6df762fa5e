//! # Step Registry
//!
//! Ordered catalogue of pipeline steps. The chain is an explicit list, so a
//! node's successor is simply the next entry; deployments that customise the
//! middle of the chain insert or remove nodes without renumbering anything.
//!
//! ## Usage
//!
//! ```rust
//! use syndication_core::orchestration::registry::StepRegistry;
//! use syndication_core::orchestration::step::StepName;
//!
//! let registry = StepRegistry::standard();
//! assert_eq!(registry.head(), StepName::Export);
//! assert_eq!(registry.successor(StepName::Export), Some(StepName::CreateSchemas));
//! assert_eq!(registry.successor(StepName::WarehouseLoadWithTags), None);
//! ```

use super::step::{StepName, StepNode};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A pipeline chain needs at least one step")]
    EmptyChain,
    #[error("Step '{0}' is registered more than once")]
    DuplicateStep(StepName),
    #[error("Step '{0}' is not registered")]
    UnknownStep(StepName),
}

/// Immutable, ordered pipeline chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRegistry {
    nodes: Vec<StepNode>,
}

impl StepRegistry {
    /// Export → CreateSchemas → Import → MigrateData → WarehouseExport →
    /// WarehouseLoad → BulkTag → WarehouseExportWithTags → WarehouseLoadWithTags
    pub fn standard() -> Self {
        Self {
            nodes: StepName::ALL.iter().map(|step| step.default_node()).collect(),
        }
    }

    pub fn from_nodes(nodes: Vec<StepNode>) -> Result<Self, RegistryError> {
        if nodes.is_empty() {
            return Err(RegistryError::EmptyChain);
        }
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name) {
                return Err(RegistryError::DuplicateStep(node.name));
            }
        }
        Ok(Self { nodes })
    }

    /// Chain made of the default nodes for `steps`, in order
    pub fn from_steps(steps: &[StepName]) -> Result<Self, RegistryError> {
        Self::from_nodes(steps.iter().map(|step| step.default_node()).collect())
    }

    pub fn head(&self) -> StepName {
        // from_nodes guarantees at least one node
        self.nodes[0].name
    }

    pub fn successor(&self, step: StepName) -> Option<StepName> {
        let position = self.position(step)?;
        self.nodes.get(position + 1).map(|node| node.name)
    }

    pub fn node(&self, step: StepName) -> Option<&StepNode> {
        self.nodes.iter().find(|node| node.name == step)
    }

    pub fn contains(&self, step: StepName) -> bool {
        self.position(step).is_some()
    }

    /// Resolve a step by its string name; `None` for unknown or unregistered names
    pub fn lookup(&self, name: &str) -> Option<StepName> {
        let step = name.parse::<StepName>().ok()?;
        self.contains(step).then_some(step)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = StepName> + '_ {
        self.nodes.iter().map(|node| node.name)
    }

    /// New chain with `node` placed directly after `anchor`
    pub fn with_inserted_after(&self, anchor: StepName, node: StepNode) -> Result<Self, RegistryError> {
        let position = self
            .position(anchor)
            .ok_or(RegistryError::UnknownStep(anchor))?;
        if self.contains(node.name) {
            return Err(RegistryError::DuplicateStep(node.name));
        }

        info!(step = %node.name, after = %anchor, "Inserting step into pipeline chain");
        let mut nodes = self.nodes.clone();
        nodes.insert(position + 1, node);
        Ok(Self { nodes })
    }

    /// New chain without `step`; its predecessor now links to its successor
    pub fn without(&self, step: StepName) -> Result<Self, RegistryError> {
        let position = self.position(step).ok_or(RegistryError::UnknownStep(step))?;
        let mut nodes = self.nodes.clone();
        nodes.remove(position);

        debug!(step = %step, "Removing step from pipeline chain");
        Self::from_nodes(nodes)
    }

    fn position(&self, step: StepName) -> Option<usize> {
        self.nodes.iter().position(|node| node.name == step)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
