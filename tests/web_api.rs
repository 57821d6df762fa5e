//! # Web API Integration Tests
//!
//! Requests go through the full router built by `create_app`, backed by the
//! in-memory pipeline.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use syndication_core::orchestration::{ContinuationPayload, ResumeContext, StepName};
use syndication_core::tagging::TagFilterStatus;
use syndication_core::test_helpers::TestPipeline;
use syndication_core::web::create_app;

fn app(pipeline: &TestPipeline) -> Router {
    create_app(pipeline.app_state())
}

async fn send(app: Router, method: Method, uri: &str, body: Body) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    send(app, Method::GET, uri, Body::empty()).await
}

#[tokio::test]
async fn test_basic_health() {
    let pipeline = TestPipeline::new();
    let (status, body) = get(app(&pipeline), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_detailed_health_reports_chain_and_counters() {
    let pipeline = TestPipeline::new();
    pipeline.steps.trigger().await.unwrap();

    let (status, body) = get(app(&pipeline), "/health/detailed").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["target_environment"], "ofda");
    assert_eq!(body["source_environments"], serde_json::json!(["crc", "nrc"]));

    let chain = body["chain"].as_array().unwrap();
    assert_eq!(chain.len(), 9);
    assert_eq!(chain[0], "export");
    assert_eq!(body["orchestrator"]["runs_initiated"], 1);
    assert_eq!(body["orchestrator"]["dispatched"], 1);
    assert!(!body["recent_messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_trigger_starts_run() {
    let pipeline = TestPipeline::new();
    let (status, _) = get(app(&pipeline), "/syndication").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(pipeline.queue.len(), 1);
    assert_eq!(pipeline.last_payload().unwrap().step(), StepName::Export);
}

#[tokio::test]
async fn test_trigger_failure_is_internal_error() {
    let pipeline = TestPipeline::new();
    pipeline.sql.fail_with("sqladmin unavailable");

    let (status, body) = get(app(&pipeline), "/syndication").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "internal_error");
    assert!(pipeline.queue.is_empty());
}

#[tokio::test]
async fn test_continuation_is_handled() {
    let pipeline = TestPipeline::new();
    pipeline.steps.trigger().await.unwrap();
    let body = pipeline.queue.last().unwrap().body.unwrap();

    let (status, _) = send(app(&pipeline), Method::POST, "/syndication/export", Body::from(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pipeline.sql.exports().len(), 1);
}

#[tokio::test]
async fn test_undecodable_continuation_is_acknowledged_and_counted() {
    let pipeline = TestPipeline::new();

    let (status, _) = send(
        app(&pipeline),
        Method::POST,
        "/syndication/import",
        Body::from("%%% not a payload %%%"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pipeline.orchestrator.stats().dropped_payloads, 1);
    assert!(pipeline.queue.is_empty());
}

#[tokio::test]
async fn test_continuation_for_another_step_is_dropped() {
    let pipeline = TestPipeline::new();
    let (run, _) = pipeline.steps.trigger().await.unwrap();
    let payload = ContinuationPayload::new(run.run_id, ResumeContext::BulkTag).encode();

    let (status, _) = send(
        app(&pipeline),
        Method::POST,
        "/syndication/load_into_big_query",
        Body::from(payload),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pipeline.orchestrator.stats().dropped_payloads, 1);
    assert!(pipeline.warehouse.loads().is_empty());
}

#[tokio::test]
async fn test_daily_bulk_tag_reads_query_context() {
    let pipeline = TestPipeline::new();
    pipeline.tag_filters.insert(1, "water", TagFilterStatus::Active);
    let (run, _) = pipeline.steps.trigger().await.unwrap();
    let context = pipeline
        .continuation_at(run.run_id, ResumeContext::BulkTag)
        .await
        .unwrap()
        .encode_for_query();

    let (status, _) = get(app(&pipeline), &format!("/tasks/tag/daily_bulk_tag?context={context}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pipeline.tag_filters.status_of(1), Some(TagFilterStatus::Active));
    assert_eq!(
        pipeline.last_payload().unwrap().context,
        ResumeContext::WarehouseExport { with_tags: true }
    );
}

#[tokio::test]
async fn test_unknown_tag_filter_is_not_found() {
    let pipeline = TestPipeline::new();

    let (status, body) = get(app(&pipeline), "/tags/bulk_tag/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "tag_filter_not_found");
}

#[tokio::test]
async fn test_edit_of_active_filter_is_bad_request() {
    let pipeline = TestPipeline::new();
    pipeline.tag_filters.insert(1, "water", TagFilterStatus::Active);

    let (status, body) = send(
        app(&pipeline),
        Method::PUT,
        "/tags/tag_filters/1",
        Body::from(r#"{"tag_text":"clean-water"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_tag_filter_status");
}

#[tokio::test]
async fn test_edit_and_delete_of_editing_filter() {
    let pipeline = TestPipeline::new();
    pipeline.tag_filters.insert(1, "water", TagFilterStatus::Editing);

    let (status, body) = send(
        app(&pipeline),
        Method::PUT,
        "/tags/tag_filters/1",
        Body::from(r#"{"tag_text":"clean-water"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tag_text"], "clean-water");
    assert_eq!(body["status"], "EDITING");

    let (status, _) = send(app(&pipeline), Method::DELETE, "/tags/tag_filters/1", Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(pipeline.tag_filters.status_of(1), None);
}

#[tokio::test]
async fn test_bulk_tag_request_then_task() {
    let pipeline = TestPipeline::new();
    pipeline.tag_filters.insert(1, "water", TagFilterStatus::Active);
    pipeline.tag_filters.set_matches(1, vec![10, 11]);

    let (status, body) = get(app(&pipeline), "/tags/bulk_tag").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], 1);

    let (status, _) = get(app(&pipeline), "/tags/bulk_tag").await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "a second bulk request waits for the first");

    let task_body = pipeline.queue.last().unwrap().body.unwrap();
    let (status, body) = send(app(&pipeline), Method::POST, "/tasks/tag/bulk_tag", Body::from(task_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], serde_json::json!([1]));
    assert_eq!(body["provenance_inserted"], 2);
}

#[tokio::test]
async fn test_single_filter_apply_and_undo_tasks() {
    let pipeline = TestPipeline::new();
    pipeline.tag_filters.insert(5, "water", TagFilterStatus::Editing);
    pipeline.tag_filters.set_matches(5, vec![10]);

    let (status, body) = get(app(&pipeline), "/tags/bulk_tag/5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PROCESSING");

    let (status, body) = get(app(&pipeline), "/tasks/tag/bulk_tag/5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provenance_inserted"], 1);

    let (status, _) = get(app(&pipeline), "/tags/bulk_tag/undo/5").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = get(app(&pipeline), "/tasks/tag/bulk_tag/undo/5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provenance_deleted"], 1);
    assert_eq!(pipeline.tag_filters.status_of(5), Some(TagFilterStatus::Editing));
}
