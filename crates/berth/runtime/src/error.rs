//! Error types for berth-runtime.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a container runtime.
///
/// `NotFound` is kept apart from every other failure because it is the
/// signal that drives drift healing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The runtime has no container with this identity.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Transient failure talking to the runtime daemon.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// The runtime refused the request (bad image, name clash, ...).
    #[error("runtime rejected request: {0}")]
    Rejected(String),

    /// The call did not complete in time.
    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_))
    }
}

/// Result type for runtime calls.
pub type Result<T> = std::result::Result<T, RuntimeError>;
