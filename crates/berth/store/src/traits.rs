//! Repository interface for fleet records and pending allocations.

use async_trait::async_trait;
use berth_pool::PoolUsage;
use berth_types::{
    FleetRecord, FleetStatus, OwnerId, PendingAllocation, PlanId, RecordId, RuntimeId, SessionId,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Input for [`FleetStore::create_pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPending {
    pub session_id: SessionId,
    pub owner_id: OwnerId,
    pub plan: PlanId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of trying to take ownership of a confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the confirmation and must drive it to an end state.
    Claimed(PendingAllocation),

    /// Already promoted; carries the resulting record.
    Consumed(FleetRecord),

    /// Another caller holds a live claim.
    InProgress(PendingAllocation),

    /// Failed or expired; nothing more will happen for this session.
    Closed(PendingAllocation),
}

/// Result of [`FleetStore::delete_or_mark_removed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// This call removed the record and released its identity.
    Removed(FleetRecord),

    /// The record was already removed; nothing was released.
    AlreadyRemoved(FleetRecord),
}

impl RemovalOutcome {
    pub fn record(&self) -> &FleetRecord {
        match self {
            RemovalOutcome::Removed(record) | RemovalOutcome::AlreadyRemoved(record) => record,
        }
    }

    pub fn into_record(self) -> FleetRecord {
        match self {
            RemovalOutcome::Removed(record) | RemovalOutcome::AlreadyRemoved(record) => record,
        }
    }
}

/// Retry policy for optimistic transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionPolicy {
    /// Attempts before giving up with `TransactionAborted`.
    pub max_attempts: u32,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self { max_attempts: 100 }
    }
}

/// Durable repository of fleet state.
///
/// Every method is its own transaction boundary. Methods that touch
/// identities (reserve, assign, release) do so in the same transaction as
/// the row they write, so the uniqueness invariants hold across concurrent
/// callers and across processes sharing a backend.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Reserve a fresh identity and record a pending allocation for it.
    async fn create_pending(&self, new: NewPending) -> StoreResult<PendingAllocation>;

    async fn get_pending(&self, session: &SessionId) -> StoreResult<Option<PendingAllocation>>;

    /// Allocations that still hold their identity.
    async fn list_open_pending(&self) -> StoreResult<Vec<PendingAllocation>>;

    /// Awaiting → Provisioning. A claim older than `lease` may be taken over.
    async fn claim_pending(
        &self,
        session: &SessionId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<ClaimOutcome>;

    /// Provisioning → Awaiting, keeping the reservation.
    async fn unclaim_pending(&self, session: &SessionId) -> StoreResult<()>;

    /// Assign the reserved identity and turn the allocation into a Running record.
    ///
    /// Fails with `NotFound` when there is no such allocation and with
    /// `AlreadyConsumed` when it was promoted before.
    async fn promote_pending_to_record(
        &self,
        session: &SessionId,
        runtime_id: RuntimeId,
        plan: PlanId,
        now: DateTime<Utc>,
    ) -> StoreResult<FleetRecord>;

    /// Release the reserved identity and mark the allocation Failed.
    async fn fail_pending(
        &self,
        session: &SessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<PendingAllocation>;

    /// Expire allocations past their deadline and release their identities.
    ///
    /// Claims older than `lease` are treated as abandoned.
    async fn expire_pending(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Vec<PendingAllocation>>;

    async fn get_by_id(&self, id: &RecordId) -> StoreResult<Option<FleetRecord>>;

    /// The live record with this name, or the most recent removed one.
    async fn get_by_name(&self, name: &str) -> StoreResult<Option<FleetRecord>>;

    async fn get_by_session(&self, session: &SessionId) -> StoreResult<Option<FleetRecord>>;

    /// Non-removed records of one owner, oldest first.
    async fn list_by_owner(&self, owner: OwnerId) -> StoreResult<Vec<FleetRecord>>;

    /// Every record, removed ones included, oldest first.
    async fn list_all(&self) -> StoreResult<Vec<FleetRecord>>;

    /// Compare-and-set a record's status.
    async fn update_status(
        &self,
        id: &RecordId,
        expected: FleetStatus,
        status: FleetStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<FleetRecord>;

    /// Mark a record Removed and release its identity. Idempotent.
    async fn delete_or_mark_removed(
        &self,
        id: &RecordId,
        now: DateTime<Utc>,
    ) -> StoreResult<RemovalOutcome>;

    async fn pool_usage(&self) -> StoreResult<PoolUsage>;
}
