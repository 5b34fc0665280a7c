//! API Router configuration

use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;
use crate::config::ServerConfig;

/// Create the main API router
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let api_routes = Router::new()
        // Health
        .route("/health", get(handlers::health_check))
        // Purchases
        .route("/allocations", post(handlers::initiate_allocation))
        .route("/allocations/expire", post(handlers::expire_allocations))
        .route("/allocations/:session_id", get(handlers::get_allocation))
        .route("/events/payment", post(handlers::payment_event))
        // Fleet
        .route("/fleet", get(handlers::list_fleet))
        .route("/fleet/all", get(handlers::list_all_fleet))
        .route(
            "/fleet/:id",
            get(handlers::get_server).delete(handlers::remove_server),
        )
        .route("/fleet/:id/start", post(handlers::start_server))
        .route("/fleet/:id/stop", post(handlers::stop_server))
        // Maintenance
        .route("/reconcile", post(handlers::reconcile));

    let router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(TimeoutLayer::new(Duration::from_secs(
            server.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http());

    let router = if server.enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}
