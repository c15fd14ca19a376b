//! API Router configuration

use super::handlers;
use super::state::AppState;
use crate::config::ServerConfig;
use axum::{
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let api_routes = Router::new()
        // Agents
        .route("/agents", post(handlers::register_agent))
        .route("/agents/:id", get(handlers::get_agent))
        // Messages
        .route("/messages", post(handlers::submit_message))
        .route("/messages/:id/process", post(handlers::process_message))
        // Proposals
        .route("/proposals", post(handlers::submit_proposal))
        .route("/proposals/:id/process", post(handlers::process_proposal))
        .route("/proposals/:id/votes", post(handlers::cast_vote))
        // Sweeps
        .route("/proactive", post(handlers::run_proactive));

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            server.request_timeout_secs.max(1),
        )));

    if server.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}
