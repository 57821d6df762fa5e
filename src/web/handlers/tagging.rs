//! # Tagging Handlers
//!
//! The operator surface only validates and changes filter status, then
//! dispatches a task; the task surface does the actual tagging.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::info;

use crate::tagging::{
    BulkTagRequest, BulkTagSummary, TagFilter, TagFilterError, TagFilterUpdate, UndoSummary,
};
use crate::web::errors::ApiResult;
use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct BulkTagQueuedResponse {
    pub queued: u64,
}

#[derive(Debug, Serialize)]
pub struct TagFilterRequestResponse {
    pub id: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub id: i64,
    pub provenance_inserted: u64,
}

/// Queue every pending filter: GET /tags/bulk_tag
pub async fn bulk_tag_all(State(state): State<AppState>) -> ApiResult<Json<BulkTagQueuedResponse>> {
    let queued = state.tagging.enqueue_all().await?;
    Ok(Json(BulkTagQueuedResponse { queued }))
}

/// Apply one filter: GET /tags/bulk_tag/:id
pub async fn bulk_tag_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<TagFilterRequestResponse>> {
    state.tagging.request_apply(id).await?;
    Ok(Json(TagFilterRequestResponse {
        id,
        status: "PROCESSING".to_string(),
    }))
}

/// Undo one filter: GET /tags/bulk_tag/undo/:id
pub async fn undo_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<TagFilterRequestResponse>> {
    state.tagging.request_undo(id).await?;
    Ok(Json(TagFilterRequestResponse {
        id,
        status: "PROCESSING".to_string(),
    }))
}

/// PUT /tags/tag_filters/:id
pub async fn update_filter(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<TagFilterUpdate>,
) -> ApiResult<Json<TagFilter>> {
    state.tagging.update_filter(id, &update).await?;
    let filter = state
        .tagging
        .store()
        .find(id)
        .await?
        .ok_or(TagFilterError::NotFound(id))?;
    Ok(Json(filter))
}

/// DELETE /tags/tag_filters/:id
pub async fn delete_filter(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.tagging.delete_filter(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Apply every queued filter: POST /tasks/tag/bulk_tag
pub async fn run_bulk_tag(State(state): State<AppState>, body: String) -> ApiResult<Json<BulkTagSummary>> {
    let request = BulkTagRequest::decode(&body)?;
    let summary = state.tagging.apply_queued(request.thread_ts.as_deref()).await?;
    info!(
        applied = summary.applied.len(),
        failed = summary.failed.len(),
        "Bulk tag task finished"
    );
    Ok(Json(summary))
}

/// GET /tasks/tag/bulk_tag/:id
pub async fn run_apply(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<ApplyResponse>> {
    let provenance_inserted = state.tagging.apply_filter(id).await?;
    Ok(Json(ApplyResponse {
        id,
        provenance_inserted,
    }))
}

/// GET /tasks/tag/bulk_tag/undo/:id
pub async fn run_undo(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<UndoSummary>> {
    let summary = state.tagging.undo_filter(id).await?;
    Ok(Json(summary))
}
