//! Fleet records: the persisted view of one provisioned container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Identity, OwnerId, PlanId, RecordId, RuntimeId, SessionId};

/// Recorded lifecycle status of a fleet record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    /// Reserved in the store, container not yet confirmed by the runtime.
    Pending,

    /// Container is running.
    Running,

    /// Container exists but is not running.
    Stopped,

    /// Container is gone; the record is kept for history only.
    Removed,
}

impl FleetStatus {
    /// Records in these states must be backed by a container the runtime knows.
    pub fn is_backed(&self) -> bool {
        matches!(self, FleetStatus::Running | FleetStatus::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FleetStatus::Pending => "pending",
            FleetStatus::Running => "running",
            FleetStatus::Stopped => "stopped",
            FleetStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for FleetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FleetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FleetStatus::Pending),
            "running" => Ok(FleetStatus::Running),
            "stopped" => Ok(FleetStatus::Stopped),
            "removed" => Ok(FleetStatus::Removed),
            other => Err(format!("unknown fleet status: {}", other)),
        }
    }
}

/// One provisioned game-server container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetRecord {
    pub id: RecordId,

    /// Container name (unique among non-removed records).
    pub name: String,

    /// Host port (unique among non-removed records).
    pub port: u16,

    pub status: FleetStatus,

    /// Plan the owner paid for.
    pub plan: PlanId,

    /// Runtime identity of the backing container.
    pub runtime_id: RuntimeId,

    pub owner_id: OwnerId,

    /// Allocation this record was promoted from.
    pub session_id: SessionId,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FleetRecord {
    pub fn identity(&self) -> Identity {
        Identity::new(self.name.clone(), self.port)
    }

    /// Whether the record still holds its name and port.
    pub fn is_active(&self) -> bool {
        self.status != FleetStatus::Removed
    }

    pub fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner_id == owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            FleetStatus::Pending,
            FleetStatus::Running,
            FleetStatus::Stopped,
            FleetStatus::Removed,
        ] {
            assert_eq!(status.as_str().parse::<FleetStatus>().unwrap(), status);
        }
        assert!("crashed".parse::<FleetStatus>().is_err());
    }

    #[test]
    fn test_backed_states() {
        assert!(FleetStatus::Running.is_backed());
        assert!(FleetStatus::Stopped.is_backed());
        assert!(!FleetStatus::Pending.is_backed());
        assert!(!FleetStatus::Removed.is_backed());
    }
}
