//! Purchase flow handlers: reserve, confirm, expire

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use berth_control::ConfirmOutcome;
use berth_types::{FleetRecord, PaymentEvent, PendingAllocation, PlanId, SessionId};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::caller::Caller;
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};

/// Request to reserve an identity for a purchase
#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub plan_id: String,

    /// Reuse an existing checkout session id; one is generated otherwise.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Reserve a name and port for a purchase that is about to be paid for
pub async fn initiate_allocation(
    State(state): State<AppState>,
    Caller(owner): Caller,
    Json(request): Json<InitiateRequest>,
) -> ApiResult<(StatusCode, Json<PendingAllocation>)> {
    if request.plan_id.trim().is_empty() {
        return Err(ApiError::BadRequest("plan_id must not be empty".into()));
    }
    let session = match request.session_id {
        Some(raw) if raw.trim().is_empty() => {
            return Err(ApiError::BadRequest("session_id must not be empty".into()))
        }
        Some(raw) => Some(SessionId::new(raw)),
        None => None,
    };

    let pending = state
        .engine
        .provisioner
        .initiate(owner, PlanId::new(request.plan_id), session)
        .await?;

    Ok((StatusCode::CREATED, Json(pending)))
}

/// Look up an allocation the caller owns
pub async fn get_allocation(
    State(state): State<AppState>,
    Caller(owner): Caller,
    Path(session_id): Path<String>,
) -> ApiResult<Json<PendingAllocation>> {
    let session = SessionId::new(session_id);
    let pending = state.engine.provisioner.allocation(&session).await?;
    // Do not reveal other owners' sessions.
    if pending.owner_id != owner {
        return Err(ApiError::NotFound(format!("allocation {}", session)));
    }
    Ok(Json(pending))
}

/// Result of handing a payment event to the provisioner
#[derive(Debug, Serialize)]
pub struct PaymentEventResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<FleetRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Accept a verified payment notification.
///
/// Redeliveries of an already-provisioned session answer 200 with the
/// existing record; a delivery racing an in-flight provisioning answers 202.
pub async fn payment_event(
    State(state): State<AppState>,
    Json(event): Json<PaymentEvent>,
) -> ApiResult<(StatusCode, Json<PaymentEventResponse>)> {
    let outcome = state.engine.provisioner.confirm(&event).await?;

    let response = match outcome {
        ConfirmOutcome::Provisioned(record) => (
            StatusCode::CREATED,
            PaymentEventResponse {
                outcome: "provisioned",
                record: Some(record),
                session_id: None,
            },
        ),
        ConfirmOutcome::Replayed(record) => (
            StatusCode::OK,
            PaymentEventResponse {
                outcome: "replayed",
                record: Some(record),
                session_id: None,
            },
        ),
        ConfirmOutcome::InProgress(session) => (
            StatusCode::ACCEPTED,
            PaymentEventResponse {
                outcome: "in_progress",
                record: None,
                session_id: Some(session),
            },
        ),
        ConfirmOutcome::Ignored => (
            StatusCode::ACCEPTED,
            PaymentEventResponse {
                outcome: "ignored",
                record: None,
                session_id: Some(event.session_id),
            },
        ),
    };

    Ok((response.0, Json(response.1)))
}

/// Allocations released by an expiry sweep
#[derive(Debug, Serialize)]
pub struct ExpireResponse {
    pub expired: Vec<PendingAllocation>,
}

/// Expire unconfirmed allocations past their deadline
pub async fn expire_allocations(State(state): State<AppState>) -> ApiResult<Json<ExpireResponse>> {
    let expired = state.engine.provisioner.expire_stale(Utc::now()).await?;
    Ok(Json(ExpireResponse { expired }))
}
