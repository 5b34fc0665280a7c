//! Health handler

use axum::{extract::State, Json};
use berth_pool::PoolUsage;
use serde::Serialize;

use crate::api::rest::state::AppState;
use crate::error::ApiResult;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
    pub pool: PoolUsage,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthCheckResponse>> {
    let pool = state.engine.store().pool_usage().await?;
    let status = if state.is_shutting_down() {
        "shutting_down"
    } else {
        "healthy"
    };

    Ok(Json(HealthCheckResponse {
        status: status.to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
        pool,
    }))
}
