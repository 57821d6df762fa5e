//! # Web API Module
//!
//! Axum-based HTTP surface of the syndication service.
//!
//! ## Core Components
//!
//! - [`routes`] - route groups for the chain, tagging and health endpoints
//! - [`handlers`] - request handlers per functional area
//! - [`state`] - shared application state
//! - [`errors`] - `ApiError` and its JSON rendering
//!
//! Chain endpoints are invoked by the continuation queue and answer 200 for
//! every handled outcome, including deferrals and dropped payloads. Only
//! unexpected failures answer 500, which lets the queue redeliver.

pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;

use axum::Router;
use state::AppState;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Create the main Axum application with all routes and middleware
pub fn create_app(app_state: AppState) -> Router {
    let request_timeout = app_state.config.request_timeout();

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::syndication_routes())
        .merge(routes::tagging_routes())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
