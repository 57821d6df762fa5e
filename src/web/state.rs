//! # Web API Application State

use crate::config::SyndicationConfig;
use crate::orchestration::TaskChainOrchestrator;
use crate::progress::MessageHistoryStore;
use crate::syndication::SyndicationSteps;
use crate::tagging::BulkTagService;
use std::sync::Arc;

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SyndicationConfig>,
    pub steps: Arc<SyndicationSteps>,
    pub tagging: Arc<BulkTagService>,
    /// Audit log, read by the detailed health check
    pub history: Arc<dyn MessageHistoryStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("environment", &self.config.environment)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(
        config: Arc<SyndicationConfig>,
        steps: Arc<SyndicationSteps>,
        tagging: Arc<BulkTagService>,
        history: Arc<dyn MessageHistoryStore>,
    ) -> Self {
        Self {
            config,
            steps,
            tagging,
            history,
        }
    }

    pub fn orchestrator(&self) -> &TaskChainOrchestrator {
        self.steps.orchestrator()
    }
}
