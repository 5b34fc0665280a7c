//! Owner-scoped fleet handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use berth_control::ReconcileReport;
use berth_types::{FleetRecord, RecordId};
use serde::{Deserialize, Serialize};

use super::caller::Caller;
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};

/// Query parameters for listing the fleet
#[derive(Debug, Default, Deserialize)]
pub struct ListFleetQuery {
    /// Reconcile the caller's records against the runtime before listing.
    #[serde(default)]
    pub refresh: bool,
}

/// The caller's servers
#[derive(Debug, Serialize)]
pub struct FleetListResponse {
    pub servers: Vec<FleetRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<ReconcileReport>,
}

fn parse_id(raw: &str) -> ApiResult<RecordId> {
    RecordId::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid record id: {}", raw)))
}

/// List the caller's servers, oldest first
pub async fn list_fleet(
    State(state): State<AppState>,
    Caller(owner): Caller,
    Query(query): Query<ListFleetQuery>,
) -> ApiResult<Json<FleetListResponse>> {
    let refresh = if query.refresh {
        Some(state.engine.reconciler.reconcile_owner(owner).await?)
    } else {
        None
    };
    let servers = state.engine.lifecycle.list(owner).await?;
    Ok(Json(FleetListResponse { servers, refresh }))
}

/// Every server of every owner. With `refresh`, a full sweep runs first.
pub async fn list_all_fleet(
    State(state): State<AppState>,
    Query(query): Query<ListFleetQuery>,
) -> ApiResult<Json<FleetListResponse>> {
    let refresh = if query.refresh {
        Some(state.engine.reconciler.reconcile().await?)
    } else {
        None
    };
    let servers = state.engine.lifecycle.list_all().await?;
    Ok(Json(FleetListResponse { servers, refresh }))
}

/// Get one server
pub async fn get_server(
    State(state): State<AppState>,
    Caller(owner): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<FleetRecord>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.lifecycle.get(&id, owner).await?))
}

pub async fn start_server(
    State(state): State<AppState>,
    Caller(owner): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<FleetRecord>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.lifecycle.start(&id, owner).await?))
}

pub async fn stop_server(
    State(state): State<AppState>,
    Caller(owner): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<FleetRecord>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.lifecycle.stop(&id, owner).await?))
}

/// Remove a server; repeating the call returns the removed record
pub async fn remove_server(
    State(state): State<AppState>,
    Caller(owner): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<FleetRecord>> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.lifecycle.remove(&id, owner).await?))
}

/// Run a full reconciliation sweep now
pub async fn reconcile(State(state): State<AppState>) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(state.engine.reconciler.reconcile().await?))
}
