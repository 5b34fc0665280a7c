//! Error types for berth-pool.

use berth_types::Identity;
use thiserror::Error;

/// Errors raised by the identity pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every port (or every name) is reserved or assigned.
    #[error("allocation exhausted: all {capacity} identities are in use")]
    Exhausted { capacity: usize },

    /// Port lies outside the configured range.
    #[error("port {0} is outside the pool range")]
    PortOutOfRange(u16),

    /// The port is held under a different name.
    #[error("identity mismatch on port {port}: held by {held}, got {given}")]
    IdentityMismatch {
        port: u16,
        held: String,
        given: String,
    },

    /// Tried to assign an identity that was never reserved.
    #[error("identity not reserved: {0}")]
    NotReserved(Identity),

    /// Two persisted claims name the same port or name.
    #[error("conflicting claim for {0}")]
    Conflict(Identity),

    /// Pool configuration is unusable.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
