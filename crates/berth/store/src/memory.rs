//! In-memory fleet store for development and testing.
//!
//! The fleet lives in a single versioned snapshot built from persistent
//! maps. A transaction clones the snapshot, applies its changes to the
//! copy and commits only if nobody else committed in between; otherwise it
//! retries against the fresh state. Readers never block writers for
//! longer than an `Arc` clone.

use std::sync::Arc;

use async_trait::async_trait;
use berth_pool::{PoolConfig, PoolUsage};
use berth_types::{
    FleetRecord, FleetStatus, OwnerId, PendingAllocation, PlanId, RecordId, RuntimeId, SessionId,
};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::error::{StoreError, StoreResult};
use crate::state::FleetState;
use crate::traits::{ClaimOutcome, FleetStore, NewPending, RemovalOutcome, TransactionPolicy};

#[derive(Debug)]
struct Versioned {
    version: u64,
    state: FleetState,
}

/// In-memory fleet store implementation.
#[derive(Debug)]
pub struct InMemoryFleetStore {
    current: RwLock<Arc<Versioned>>,
    policy: TransactionPolicy,
}

impl InMemoryFleetStore {
    /// Create an empty store over the given identity range.
    pub fn new(config: PoolConfig) -> StoreResult<Self> {
        Self::with_policy(config, TransactionPolicy::default())
    }

    pub fn with_policy(config: PoolConfig, policy: TransactionPolicy) -> StoreResult<Self> {
        Ok(Self {
            current: RwLock::new(Arc::new(Versioned {
                version: 0,
                state: FleetState::new(config)?,
            })),
            policy,
        })
    }

    /// Number of committed transactions so far.
    pub async fn version(&self) -> u64 {
        self.current.read().await.version
    }

    async fn snapshot(&self) -> Arc<Versioned> {
        self.current.read().await.clone()
    }

    async fn transact<T, F>(&self, op: &'static str, mut body: F) -> StoreResult<T>
    where
        T: Send,
        F: FnMut(&mut FleetState) -> StoreResult<T> + Send,
    {
        for attempt in 1..=self.policy.max_attempts {
            let base = self.snapshot().await;
            let mut working = base.state.clone();
            let value = body(&mut working)?;

            let mut current = self.current.write().await;
            if current.version == base.version {
                *current = Arc::new(Versioned {
                    version: base.version + 1,
                    state: working,
                });
                return Ok(value);
            }
            drop(current);

            trace!(op, attempt, "write conflict, retrying");
            tokio::task::yield_now().await;
        }

        warn!(op, attempts = self.policy.max_attempts, "transaction aborted");
        Err(StoreError::TransactionAborted {
            op,
            attempts: self.policy.max_attempts,
        })
    }
}

fn oldest_first(mut records: Vec<FleetRecord>) -> Vec<FleetRecord> {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    records
}

#[async_trait]
impl FleetStore for InMemoryFleetStore {
    async fn create_pending(&self, new: NewPending) -> StoreResult<PendingAllocation> {
        let allocation = self
            .transact("create_pending", |state| state.create_pending(&new))
            .await?;
        debug!(
            session = %allocation.session_id,
            identity = %allocation.identity,
            "allocation reserved"
        );
        Ok(allocation)
    }

    async fn get_pending(&self, session: &SessionId) -> StoreResult<Option<PendingAllocation>> {
        Ok(self.snapshot().await.state.pending.get(session).cloned())
    }

    async fn list_open_pending(&self) -> StoreResult<Vec<PendingAllocation>> {
        let snapshot = self.snapshot().await;
        let mut open: Vec<PendingAllocation> = snapshot
            .state
            .pending
            .values()
            .filter(|p| p.state.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(open)
    }

    async fn claim_pending(
        &self,
        session: &SessionId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<ClaimOutcome> {
        self.transact("claim_pending", |state| state.claim(session, now, lease))
            .await
    }

    async fn unclaim_pending(&self, session: &SessionId) -> StoreResult<()> {
        self.transact("unclaim_pending", |state| state.unclaim(session))
            .await
    }

    async fn promote_pending_to_record(
        &self,
        session: &SessionId,
        runtime_id: RuntimeId,
        plan: PlanId,
        now: DateTime<Utc>,
    ) -> StoreResult<FleetRecord> {
        self.transact("promote_pending_to_record", |state| {
            state.promote(session, &runtime_id, &plan, now)
        })
        .await
    }

    async fn fail_pending(
        &self,
        session: &SessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<PendingAllocation> {
        self.transact("fail_pending", |state| state.fail(session, reason, now))
            .await
    }

    async fn expire_pending(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Vec<PendingAllocation>> {
        self.transact("expire_pending", |state| state.expire(now, lease))
            .await
    }

    async fn get_by_id(&self, id: &RecordId) -> StoreResult<Option<FleetRecord>> {
        Ok(self.snapshot().await.state.records.get(id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> StoreResult<Option<FleetRecord>> {
        let snapshot = self.snapshot().await;
        let mut matching: Vec<&FleetRecord> = snapshot
            .state
            .records
            .values()
            .filter(|r| r.name == name)
            .collect();
        matching.sort_by_key(|r| (r.is_active(), r.updated_at));
        Ok(matching.last().map(|r| (*r).clone()))
    }

    async fn get_by_session(&self, session: &SessionId) -> StoreResult<Option<FleetRecord>> {
        let snapshot = self.snapshot().await;
        Ok(snapshot
            .state
            .records
            .values()
            .find(|r| &r.session_id == session)
            .cloned())
    }

    async fn list_by_owner(&self, owner: OwnerId) -> StoreResult<Vec<FleetRecord>> {
        let snapshot = self.snapshot().await;
        Ok(oldest_first(
            snapshot
                .state
                .records
                .values()
                .filter(|r| r.is_owned_by(owner) && r.is_active())
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> StoreResult<Vec<FleetRecord>> {
        let snapshot = self.snapshot().await;
        Ok(oldest_first(snapshot.state.records.values().cloned().collect()))
    }

    async fn update_status(
        &self,
        id: &RecordId,
        expected: FleetStatus,
        status: FleetStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<FleetRecord> {
        self.transact("update_status", |state| {
            state.update_status(id, expected, status, now)
        })
        .await
    }

    async fn delete_or_mark_removed(
        &self,
        id: &RecordId,
        now: DateTime<Utc>,
    ) -> StoreResult<RemovalOutcome> {
        self.transact("delete_or_mark_removed", |state| state.mark_removed(id, now))
            .await
    }

    async fn pool_usage(&self) -> StoreResult<PoolUsage> {
        Ok(self.snapshot().await.state.pool.usage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_pool::{PoolError, SlotState};
    use berth_types::AllocationState;
    use std::collections::HashSet;

    fn small_pool(ports: u16) -> PoolConfig {
        PoolConfig {
            min_port: 25566,
            max_port: 25566 + ports - 1,
            ..PoolConfig::default()
        }
    }

    fn new_pending(session: &str, owner: i64) -> NewPending {
        let now = Utc::now();
        NewPending {
            session_id: SessionId::new(session),
            owner_id: OwnerId::new(owner),
            plan: PlanId::new("planB"),
            created_at: now,
            expires_at: now + Duration::minutes(30),
        }
    }

    async fn provision(store: &InMemoryFleetStore, session: &str, owner: i64) -> FleetRecord {
        let pending = store.create_pending(new_pending(session, owner)).await.unwrap();
        store
            .promote_pending_to_record(
                &pending.session_id,
                RuntimeId::new(format!("rt-{}", session)),
                PlanId::new("planB"),
                Utc::now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_pending_rejects_duplicate_session() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        store.create_pending(new_pending("cs_1", 1)).await.unwrap();

        let err = store.create_pending(new_pending("cs_1", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionExists(_)));
        assert_eq!(store.pool_usage().await.unwrap().reserved, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_leaves_no_partial_state() {
        let store = InMemoryFleetStore::new(small_pool(1)).unwrap();
        store.create_pending(new_pending("cs_1", 1)).await.unwrap();

        let err = store.create_pending(new_pending("cs_2", 1)).await.unwrap_err();
        assert!(err.is_exhausted());
        assert!(matches!(err, StoreError::Pool(PoolError::Exhausted { capacity: 1 })));
        assert!(store
            .get_pending(&SessionId::new("cs_2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_are_distinct() {
        let store = Arc::new(InMemoryFleetStore::new(small_pool(32)).unwrap());

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create_pending(new_pending(&format!("cs_{}", i), i))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for handle in handles {
            let pending = handle.await.unwrap();
            assert!(names.insert(pending.identity.name.clone()));
            assert!(ports.insert(pending.identity.port));
        }
        assert_eq!(store.pool_usage().await.unwrap().free, 0);
    }

    #[tokio::test]
    async fn test_promote_once() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let record = provision(&store, "cs_1", 42).await;
        assert_eq!(record.status, FleetStatus::Running);
        assert_eq!(record.owner_id, OwnerId::new(42));

        let pending = store
            .get_pending(&SessionId::new("cs_1"))
            .await
            .unwrap()
            .unwrap();
        assert!(pending.consumed_at().is_some());

        let err = store
            .promote_pending_to_record(
                &SessionId::new("cs_1"),
                RuntimeId::new("other"),
                PlanId::new("planB"),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyConsumed { record_id, .. } if record_id == record.id));
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_promote_unknown_session() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let err = store
            .promote_pending_to_record(
                &SessionId::new("missing"),
                RuntimeId::new("rt"),
                PlanId::new("planA"),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_claim_reports_consumed_record() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let record = provision(&store, "cs_1", 42).await;

        let outcome = store
            .claim_pending(&SessionId::new("cs_1"), Utc::now(), Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Consumed(record));
    }

    #[tokio::test]
    async fn test_unclaim_returns_to_awaiting() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let session = SessionId::new("cs_1");
        store.create_pending(new_pending("cs_1", 1)).await.unwrap();

        store
            .claim_pending(&session, Utc::now(), Duration::minutes(5))
            .await
            .unwrap();
        store.unclaim_pending(&session).await.unwrap();

        let pending = store.get_pending(&session).await.unwrap().unwrap();
        assert_eq!(pending.state, AllocationState::Awaiting);
    }

    #[tokio::test]
    async fn test_expire_releases_stale_allocations_only() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let fresh = store.create_pending(new_pending("cs_fresh", 1)).await.unwrap();

        let mut old = new_pending("cs_old", 1);
        old.created_at = Utc::now() - Duration::hours(2);
        old.expires_at = Utc::now() - Duration::hours(1);
        let old = store.create_pending(old).await.unwrap();

        let expired = store
            .expire_pending(Utc::now(), Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, old.session_id);

        let open = store.list_open_pending().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].session_id, fresh.session_id);

        let usage = store.pool_usage().await.unwrap();
        assert_eq!(usage.reserved, 1);

        // Nothing left to expire the second time round.
        assert!(store
            .expire_pending(Utc::now(), Duration::minutes(5))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_expire_skips_live_claims() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let mut old = new_pending("cs_old", 1);
        old.expires_at = Utc::now() - Duration::minutes(1);
        let old = store.create_pending(old).await.unwrap();

        store
            .claim_pending(&old.session_id, Utc::now(), Duration::minutes(5))
            .await
            .unwrap();
        assert!(store
            .expire_pending(Utc::now(), Duration::minutes(5))
            .await
            .unwrap()
            .is_empty());

        let later = Utc::now() + Duration::minutes(10);
        assert_eq!(
            store
                .expire_pending(later, Duration::minutes(5))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_update_status_is_compare_and_set() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let record = provision(&store, "cs_1", 1).await;

        let stopped = store
            .update_status(&record.id, FleetStatus::Running, FleetStatus::Stopped, Utc::now())
            .await
            .unwrap();
        assert_eq!(stopped.status, FleetStatus::Stopped);

        let err = store
            .update_status(&record.id, FleetStatus::Running, FleetStatus::Stopped, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatusConflict {
                actual: FleetStatus::Stopped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_removal_is_idempotent_and_frees_identity() {
        let store = InMemoryFleetStore::new(small_pool(1)).unwrap();
        let record = provision(&store, "cs_1", 1).await;

        let first = store
            .delete_or_mark_removed(&record.id, Utc::now())
            .await
            .unwrap();
        assert!(matches!(first, RemovalOutcome::Removed(_)));
        let second = store
            .delete_or_mark_removed(&record.id, Utc::now())
            .await
            .unwrap();
        assert!(matches!(second, RemovalOutcome::AlreadyRemoved(_)));

        assert_eq!(store.pool_usage().await.unwrap().free, 1);
        assert!(store.list_by_owner(OwnerId::new(1)).await.unwrap().is_empty());
        assert_eq!(store.list_all().await.unwrap().len(), 1);

        // The freed identity is handed out again.
        let again = store.create_pending(new_pending("cs_2", 2)).await.unwrap();
        assert_eq!(again.identity, record.identity());
    }

    #[tokio::test]
    async fn test_get_by_name_prefers_live_record() {
        let store = InMemoryFleetStore::new(small_pool(1)).unwrap();
        let first = provision(&store, "cs_1", 1).await;
        store
            .delete_or_mark_removed(&first.id, Utc::now())
            .await
            .unwrap();
        let second = provision(&store, "cs_2", 2).await;
        assert_eq!(first.name, second.name);

        let found = store.get_by_name(&first.name).await.unwrap().unwrap();
        assert_eq!(found.id, second.id);
    }

    #[tokio::test]
    async fn test_list_by_owner_is_scoped_and_ordered() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let a = provision(&store, "cs_a", 7).await;
        provision(&store, "cs_b", 8).await;
        let c = provision(&store, "cs_c", 7).await;

        let owned = store.list_by_owner(OwnerId::new(7)).await.unwrap();
        let ids: Vec<_> = owned.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&c.id));
        assert!(owned[0].created_at <= owned[1].created_at);
    }

    #[tokio::test]
    async fn test_pool_matches_records() {
        let store = InMemoryFleetStore::new(small_pool(4)).unwrap();
        let record = provision(&store, "cs_1", 1).await;
        let snapshot = store.snapshot().await;
        assert_eq!(
            snapshot.state.pool.state_of(record.port),
            Some(SlotState::Assigned)
        );
        assert_eq!(
            snapshot.state.pool.holder_of(record.port),
            Some(record.name.as_str())
        );
    }
}
