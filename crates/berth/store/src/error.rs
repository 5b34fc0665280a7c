//! Error types for berth-store.

use berth_pool::PoolError;
use berth_types::{FleetStatus, RecordId, SessionId};
use thiserror::Error;

/// Errors raised by fleet repository operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No such record or allocation.
    #[error("not found: {0}")]
    NotFound(String),

    /// An allocation with this session id already exists.
    #[error("session already exists: {0}")]
    SessionExists(SessionId),

    /// The allocation was already promoted into a record.
    #[error("allocation {session} already consumed by {record_id}")]
    AlreadyConsumed {
        session: SessionId,
        record_id: RecordId,
    },

    /// The allocation failed or expired and can no longer be promoted.
    #[error("allocation {session} is closed ({state})")]
    AllocationClosed { session: SessionId, state: String },

    /// Compare-and-set on a record's status lost against a concurrent change.
    #[error("status conflict on {record_id}: expected {expected}, found {actual}")]
    StatusConflict {
        record_id: RecordId,
        expected: FleetStatus,
        actual: FleetStatus,
    },

    /// Operation not legal for the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Uniqueness constraint would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Identity pool refused the operation.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Another transaction committed first; safe to retry.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// Retries exhausted.
    #[error("transaction {op} aborted after {attempts} attempts")]
    TransactionAborted { op: &'static str, attempts: u32 },

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Query error.
    #[error("query error: {0}")]
    Query(String),

    /// Stored data could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, StoreError::Pool(PoolError::Exhausted { .. }))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
