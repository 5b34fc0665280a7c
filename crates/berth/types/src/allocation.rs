//! Pending allocations: reserved identities awaiting payment confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Identity, OwnerId, PlanId, RecordId, SessionId};

/// Where a pending allocation is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AllocationState {
    /// Identity reserved, waiting for the confirmation event.
    Awaiting,

    /// A confirmation is being applied; the runtime call is in flight.
    Provisioning { claimed_at: DateTime<Utc> },

    /// Promoted into a fleet record. Terminal.
    Consumed {
        consumed_at: DateTime<Utc>,
        record_id: RecordId,
    },

    /// Provisioning failed permanently and the identity was released. Terminal.
    Failed {
        failed_at: DateTime<Utc>,
        reason: String,
    },

    /// No confirmation arrived before `expires_at`. Terminal.
    Expired { expired_at: DateTime<Utc> },
}

impl AllocationState {
    pub fn label(&self) -> &'static str {
        match self {
            AllocationState::Awaiting => "awaiting",
            AllocationState::Provisioning { .. } => "provisioning",
            AllocationState::Consumed { .. } => "consumed",
            AllocationState::Failed { .. } => "failed",
            AllocationState::Expired { .. } => "expired",
        }
    }

    /// Open allocations still hold their identity.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            AllocationState::Awaiting | AllocationState::Provisioning { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

/// A reservation keyed by its idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAllocation {
    pub session_id: SessionId,

    /// Reserved container name and host port.
    pub identity: Identity,

    pub owner_id: OwnerId,

    /// Plan selected at purchase time.
    pub plan: PlanId,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    #[serde(flatten)]
    pub state: AllocationState,
}

impl PendingAllocation {
    pub fn reserved_name(&self) -> &str {
        &self.identity.name
    }

    pub fn reserved_port(&self) -> u16 {
        self.identity.port
    }

    pub fn consumed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            AllocationState::Consumed { consumed_at, .. } => Some(*consumed_at),
            _ => None,
        }
    }

    /// Awaiting allocations past their deadline are eligible for expiry.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, AllocationState::Awaiting) && self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn allocation(state: AllocationState) -> PendingAllocation {
        let now = Utc::now();
        PendingAllocation {
            session_id: SessionId::new("cs_test"),
            identity: Identity::new("srv_000001", 25565),
            owner_id: OwnerId::new(42),
            plan: PlanId::new("planB"),
            created_at: now,
            expires_at: now + Duration::minutes(30),
            state,
        }
    }

    #[test]
    fn test_open_states() {
        assert!(AllocationState::Awaiting.is_open());
        assert!(AllocationState::Provisioning {
            claimed_at: Utc::now()
        }
        .is_open());
        assert!(AllocationState::Expired {
            expired_at: Utc::now()
        }
        .is_terminal());
    }

    #[test]
    fn test_staleness_only_applies_to_awaiting() {
        let awaiting = allocation(AllocationState::Awaiting);
        let later = awaiting.expires_at + Duration::seconds(1);
        assert!(!awaiting.is_stale_at(awaiting.created_at));
        assert!(awaiting.is_stale_at(later));

        let claimed = allocation(AllocationState::Provisioning {
            claimed_at: Utc::now(),
        });
        assert!(!claimed.is_stale_at(later));
    }

    #[test]
    fn test_consumed_at_only_for_consumed() {
        let at = Utc::now();
        let consumed = allocation(AllocationState::Consumed {
            consumed_at: at,
            record_id: RecordId::generate(),
        });
        assert_eq!(consumed.consumed_at(), Some(at));
        assert_eq!(allocation(AllocationState::Awaiting).consumed_at(), None);
        assert_eq!(
            allocation(AllocationState::Expired { expired_at: at }).consumed_at(),
            None
        );
    }

    #[test]
    fn test_state_serializes_flat() {
        let value = serde_json::to_value(allocation(AllocationState::Awaiting)).unwrap();
        assert_eq!(value["state"], "awaiting");
        assert_eq!(value["identity"]["port"], 25565);
    }
}
