//! # Syndication Chain Handlers
//!
//! `GET /syndication` starts a run; every other endpoint is a continuation
//! delivered by the queue. A continuation that cannot be decoded is logged,
//! counted and acknowledged so the queue does not redeliver it forever.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::{info, warn};

use crate::orchestration::{ContinuationPayload, StepName};
use crate::web::errors::ApiResult;
use crate::web::state::AppState;

/// Query string of GET chain steps
#[derive(Debug, Default, Deserialize)]
pub struct ContextQuery {
    #[serde(default)]
    pub context: Option<String>,
}

/// Start a run: GET /syndication
pub async fn trigger(State(state): State<AppState>) -> ApiResult<StatusCode> {
    let (run, outcome) = state.steps.trigger().await?;
    info!(run_id = %run.run_id, outcome = %outcome, "Syndication run triggered");
    Ok(StatusCode::OK)
}

/// Decode a continuation for `step` and hand it to the step handlers
async fn continue_step(state: &AppState, step: StepName, raw: &str) -> ApiResult<StatusCode> {
    let payload = match ContinuationPayload::decode_for(step, raw) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(step = %step, error = %e, "Undecodable continuation acknowledged");
            state.orchestrator().record_dropped_payload(step, &e.to_string());
            return Ok(StatusCode::OK);
        }
    };

    state.steps.handle(payload).await?;
    Ok(StatusCode::OK)
}

/// POST /syndication/export
pub async fn export(State(state): State<AppState>, body: String) -> ApiResult<StatusCode> {
    continue_step(&state, StepName::Export, &body).await
}

/// POST /syndication/import
pub async fn import(State(state): State<AppState>, body: String) -> ApiResult<StatusCode> {
    continue_step(&state, StepName::Import, &body).await
}

/// POST /syndication/schemas_and_migration/create_all_schemas
pub async fn create_all_schemas(State(state): State<AppState>, body: String) -> ApiResult<StatusCode> {
    continue_step(&state, StepName::CreateSchemas, &body).await
}

/// POST /syndication/schemas_and_migration/migrate_all_data
pub async fn migrate_all_data(State(state): State<AppState>, body: String) -> ApiResult<StatusCode> {
    continue_step(&state, StepName::MigrateData, &body).await
}

pub async fn export_for_big_query(State(state): State<AppState>, body: String) -> ApiResult<StatusCode> {
    continue_step(&state, StepName::WarehouseExport, &body).await
}

pub async fn export_for_big_query_with_tags(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<StatusCode> {
    continue_step(&state, StepName::WarehouseExportWithTags, &body).await
}

pub async fn load_into_big_query(State(state): State<AppState>, body: String) -> ApiResult<StatusCode> {
    continue_step(&state, StepName::WarehouseLoad, &body).await
}

pub async fn load_into_big_query_with_tags(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<StatusCode> {
    continue_step(&state, StepName::WarehouseLoadWithTags, &body).await
}

/// Daily bulk tagging node of the chain: GET /tasks/tag/daily_bulk_tag?context=
pub async fn daily_bulk_tag(
    State(state): State<AppState>,
    Query(query): Query<ContextQuery>,
) -> ApiResult<StatusCode> {
    let raw = query.context.unwrap_or_default();
    continue_step(&state, StepName::BulkTag, &raw).await
}
