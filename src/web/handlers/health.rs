//! # Health Check Handlers

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::{debug, warn};

use crate::orchestration::OrchestratorStatsSnapshot;
use crate::web::state::AppState;

const RECENT_MESSAGE_LIMIT: i64 = 10;

/// Basic health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

/// Detailed health check response
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub timestamp: String,
    pub environment: String,
    pub target_environment: String,
    pub source_environments: Vec<String>,
    pub chain: Vec<String>,
    pub orchestrator: OrchestratorStatsSnapshot,
    pub recent_messages: Vec<RecentMessage>,
}

#[derive(Debug, Serialize)]
pub struct RecentMessage {
    pub event: String,
    pub body: String,
    pub created_at: String,
}

/// GET /health
pub async fn basic_health(_state: State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /health/detailed
///
/// Chain layout, orchestrator counters (dispatches, deferrals, dropped
/// payloads, unknown skip targets, dead letters) and the latest audit entries.
pub async fn detailed_health(State(state): State<AppState>) -> Json<DetailedHealthResponse> {
    debug!("Performing detailed health check");

    let orchestrator = state.orchestrator();
    let (status, recent_messages) = match state.history.recent(RECENT_MESSAGE_LIMIT).await {
        Ok(entries) => (
            "healthy",
            entries
                .into_iter()
                .map(|entry| RecentMessage {
                    event: entry.event.as_str().to_string(),
                    body: entry.body,
                    created_at: entry.created_at.to_rfc3339(),
                })
                .collect(),
        ),
        Err(e) => {
            warn!(error = %e, "Message history unavailable");
            ("degraded", Vec::new())
        }
    };

    Json(DetailedHealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        environment: state.config.environment.clone(),
        target_environment: state.config.syndication.target_environment.clone(),
        source_environments: state.config.syndication.active_source_environments(),
        chain: orchestrator
            .registry()
            .steps()
            .map(|step| step.as_str().to_string())
            .collect(),
        orchestrator: orchestrator.stats(),
        recent_messages,
    })
}
