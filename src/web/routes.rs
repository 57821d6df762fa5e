//! # Route Definitions
//!
//! Paths are fixed by the continuation queue dispatches and by the operator
//! tooling calling the tagging surface.

use crate::web::handlers;
use crate::web::state::AppState;
use axum::routing::{get, post, put};
use axum::Router;

/// Trigger plus one endpoint per chain step
pub fn syndication_routes() -> Router<AppState> {
    Router::new()
        .route("/syndication", get(handlers::syndication::trigger))
        .route("/syndication/export", post(handlers::syndication::export))
        .route("/syndication/import", post(handlers::syndication::import))
        .route(
            "/syndication/schemas_and_migration/create_all_schemas",
            post(handlers::syndication::create_all_schemas),
        )
        .route(
            "/syndication/schemas_and_migration/migrate_all_data",
            post(handlers::syndication::migrate_all_data),
        )
        .route(
            "/syndication/export_for_big_query",
            post(handlers::syndication::export_for_big_query),
        )
        .route(
            "/syndication/export_for_big_query_with_tags",
            post(handlers::syndication::export_for_big_query_with_tags),
        )
        .route(
            "/syndication/load_into_big_query",
            post(handlers::syndication::load_into_big_query),
        )
        .route(
            "/syndication/load_into_big_query_with_tags",
            post(handlers::syndication::load_into_big_query_with_tags),
        )
        .route(
            "/tasks/tag/daily_bulk_tag",
            get(handlers::syndication::daily_bulk_tag),
        )
}

/// Operator requests and the single-hop tasks they dispatch
pub fn tagging_routes() -> Router<AppState> {
    Router::new()
        // Operator surface
        .route("/tags/bulk_tag", get(handlers::tagging::bulk_tag_all))
        .route("/tags/bulk_tag/:id", get(handlers::tagging::bulk_tag_one))
        .route("/tags/bulk_tag/undo/:id", get(handlers::tagging::undo_one))
        .route(
            "/tags/tag_filters/:id",
            put(handlers::tagging::update_filter).delete(handlers::tagging::delete_filter),
        )
        // Task surface
        .route("/tasks/tag/bulk_tag", post(handlers::tagging::run_bulk_tag))
        .route("/tasks/tag/bulk_tag/:id", get(handlers::tagging::run_apply))
        .route("/tasks/tag/bulk_tag/undo/:id", get(handlers::tagging::run_undo))
}

/// `/health` and `/health/detailed`
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health::basic_health))
        .route("/health/detailed", get(handlers::health::detailed_health))
}
