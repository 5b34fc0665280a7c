//! Fleet engine error types

use berth_pool::PoolError;
use berth_runtime::RuntimeError;
use berth_store::StoreError;
use berth_types::{FleetStatus, OwnerId, PlanId, RecordId, SessionId};
use thiserror::Error;

/// Errors surfaced by the provisioning, reconciliation and lifecycle components.
///
/// A duplicate confirmation and an orphaned record are not errors; they are
/// reported through `ConfirmOutcome::Replayed` and the reconcile report.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Allocation exhausted: all {capacity} identities are reserved or assigned")]
    AllocationExhausted { capacity: usize },

    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Runtime failed to create container for {session}: {reason}")]
    RuntimeCreateFailed { session: SessionId, reason: String },

    #[error("Owner {caller} is not allowed to manage {record_id}")]
    AuthorizationDenied { record_id: RecordId, caller: OwnerId },

    #[error("Cannot {operation} {record_id} while it is {status}")]
    InvalidStateTransition {
        record_id: RecordId,
        operation: &'static str,
        status: FleetStatus,
    },

    #[error("Unknown plan: {0}")]
    UnknownPlan(PlanId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {0} belongs to another owner")]
    SessionConflict(SessionId),

    #[error("Allocation for {0} expired before it was confirmed")]
    AllocationExpired(SessionId),

    #[error("Allocation for {session} failed: {reason}")]
    AllocationFailed { session: SessionId, reason: String },

    #[error("Fleet record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("Container backing {0} is gone; the record was removed")]
    ContainerMissing(RecordId),

    #[error("Runtime error: {0}")]
    Runtime(RuntimeError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl FleetError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::AllocationExhausted { .. } | FleetError::RuntimeUnavailable(_)
        ) || matches!(
            self,
            FleetError::Store(StoreError::TransactionAborted { .. })
                | FleetError::Store(StoreError::Connection(_))
        )
    }
}

impl From<StoreError> for FleetError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Pool(PoolError::Exhausted { capacity }) => {
                FleetError::AllocationExhausted { capacity }
            }
            other => FleetError::Store(other),
        }
    }
}

impl From<RuntimeError> for FleetError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(reason) => FleetError::RuntimeUnavailable(reason),
            RuntimeError::Timeout(after) => {
                FleetError::RuntimeUnavailable(format!("timed out after {:?}", after))
            }
            other => FleetError::Runtime(other),
        }
    }
}

/// Result type for fleet engine operations.
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_maps_to_allocation_exhausted() {
        let err: FleetError = StoreError::Pool(PoolError::Exhausted { capacity: 36 }).into();
        assert!(matches!(err, FleetError::AllocationExhausted { capacity: 36 }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_runtime_error_mapping() {
        let err: FleetError = RuntimeError::Unavailable("socket closed".into()).into();
        assert!(matches!(err, FleetError::RuntimeUnavailable(_)));

        let err: FleetError = RuntimeError::Rejected("bad image".into()).into();
        assert!(matches!(err, FleetError::Runtime(RuntimeError::Rejected(_))));
        assert!(!err.is_retryable());
    }
}
