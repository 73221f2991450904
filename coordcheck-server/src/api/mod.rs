//! HTTP API surface
//!
//! Route table for the validation, learning, catalog inspection, and
//! administrative endpoints. Wire-level concerns stop here; handlers
//! translate to model types and call the engines.

mod batch;
mod handlers;

use std::time::Duration;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::AppState;

/// Wall-clock deadline for one request; downstream catalog calls inherit
/// it by running inside the handler future
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

pub fn router(state: AppState) -> Router {
    Router::new()
        // Health and build identification
        .route("/health", get(handlers::health))
        .route("/build_info", get(handlers::build_info))
        // Validation flow
        .route("/validate", post(handlers::validate))
        .route("/validate/batch", post(batch::validate_batch))
        // Learning flow
        .route("/learn", post(handlers::learn))
        .route("/companions/:object_id", get(handlers::get_companions))
        // Operator overrides and point inspection
        .route("/absolute", put(handlers::set_absolute))
        .route(
            "/absolute/:point_type/:point_id",
            delete(handlers::remove_absolute),
        )
        .route("/points/:point_type/:point_id", get(handlers::get_point_info))
        // Runtime configuration
        .route("/config", get(handlers::get_config))
        .route("/config", post(handlers::update_config))
        .route("/config/reset", post(handlers::reset_config))
        .route("/config/history", get(handlers::get_config_history))
        .with_state(state)
        .layer(TimeoutLayer::new(REQUEST_DEADLINE))
        // Enable CORS for local tooling
        .layer(CorsLayer::permissive())
}
