//! Error types for berth-daemon

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use berth_control::FleetError;
use berth_store::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Engine assembly error
    #[error("Engine error: {0}")]
    Engine(#[from] FleetError),

    /// Runtime backend error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The caller did not identify itself
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Engine error
    #[error("{0}")]
    Fleet(#[from] FleetError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Fleet(err.into())
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            ApiError::Fleet(err) => fleet_status(err),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Fleet(FleetError::AllocationExhausted { capacity }) => {
                Some(serde_json::json!({ "capacity": capacity }))
            }
            ApiError::Fleet(FleetError::InvalidStateTransition {
                record_id,
                operation,
                status,
            }) => Some(serde_json::json!({
                "record_id": record_id,
                "operation": operation,
                "status": status,
            })),
            _ => None,
        }
    }
}

fn fleet_status(err: &FleetError) -> (StatusCode, &'static str) {
    match err {
        FleetError::AuthorizationDenied { .. } => (StatusCode::FORBIDDEN, "AUTHORIZATION_DENIED"),
        FleetError::InvalidStateTransition { .. } => {
            (StatusCode::CONFLICT, "INVALID_STATE_TRANSITION")
        }
        FleetError::AllocationExhausted { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "ALLOCATION_EXHAUSTED")
        }
        FleetError::RuntimeUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "RUNTIME_UNAVAILABLE")
        }
        FleetError::UnknownPlan(_) => (StatusCode::UNPROCESSABLE_ENTITY, "UNKNOWN_PLAN"),
        FleetError::RecordNotFound(_) => (StatusCode::NOT_FOUND, "RECORD_NOT_FOUND"),
        FleetError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
        FleetError::SessionConflict(_) => (StatusCode::CONFLICT, "SESSION_CONFLICT"),
        FleetError::AllocationExpired(_) => (StatusCode::CONFLICT, "ALLOCATION_EXPIRED"),
        FleetError::AllocationFailed { .. } => (StatusCode::CONFLICT, "ALLOCATION_FAILED"),
        FleetError::ContainerMissing(_) => (StatusCode::GONE, "CONTAINER_MISSING"),
        FleetError::RuntimeCreateFailed { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "RUNTIME_CREATE_FAILED")
        }
        other if other.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "RETRY_LATER"),
        FleetError::Runtime(_) => (StatusCode::INTERNAL_SERVER_ERROR, "RUNTIME_ERROR"),
        FleetError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
        FleetError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::warn!(code, error = %self, "request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            details: self.details(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;
    use berth_pool::PoolError;
    use berth_types::{FleetStatus, OwnerId, PlanId, RecordId};

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            status_of(ApiError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ApiError::BadRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::Unauthenticated("x".into())),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_fleet_error_status_codes() {
        let id = RecordId::generate();
        assert_eq!(
            status_of(
                FleetError::AuthorizationDenied {
                    record_id: id,
                    caller: OwnerId::new(1),
                }
                .into()
            ),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(
                FleetError::InvalidStateTransition {
                    record_id: id,
                    operation: "start",
                    status: FleetStatus::Running,
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(FleetError::UnknownPlan(PlanId::new("planZ")).into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(FleetError::RecordNotFound(id).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(FleetError::RuntimeUnavailable("down".into()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_exhaustion_from_store_is_service_unavailable() {
        let err: ApiError = StoreError::Pool(PoolError::Exhausted { capacity: 36 }).into();
        assert_eq!(status_of(err), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_aborted_transaction_is_retryable() {
        let err: ApiError = StoreError::TransactionAborted {
            op: "claim_pending",
            attempts: 100,
        }
        .into();
        assert_eq!(status_of(err), StatusCode::SERVICE_UNAVAILABLE);
    }
}
