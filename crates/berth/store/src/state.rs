//! Transaction body for the in-memory store.
//!
//! `FleetState` is the whole fleet as one value. Each mutation here runs
//! against a private copy inside a transaction and only becomes visible if
//! the commit wins.

use berth_pool::{IdentityPool, PoolConfig};
use berth_types::{
    AllocationState, FleetRecord, FleetStatus, PendingAllocation, PlanId, RecordId, RuntimeId,
    SessionId,
};
use chrono::{DateTime, Duration, Utc};

use crate::error::{StoreError, StoreResult};
use crate::traits::{ClaimOutcome, NewPending, RemovalOutcome};

#[derive(Debug, Clone)]
pub(crate) struct FleetState {
    pub(crate) pool: IdentityPool,
    pub(crate) records: im::HashMap<RecordId, FleetRecord>,
    pub(crate) pending: im::HashMap<SessionId, PendingAllocation>,
}

impl FleetState {
    pub(crate) fn new(config: PoolConfig) -> StoreResult<Self> {
        Ok(Self {
            pool: IdentityPool::new(config)?,
            records: im::HashMap::new(),
            pending: im::HashMap::new(),
        })
    }

    /// A state holding only the ledger; callers load the rows they touch.
    #[cfg_attr(not(feature = "postgres"), allow(dead_code))]
    pub(crate) fn from_pool(pool: IdentityPool) -> Self {
        Self {
            pool,
            records: im::HashMap::new(),
            pending: im::HashMap::new(),
        }
    }

    pub(crate) fn create_pending(&mut self, new: &NewPending) -> StoreResult<PendingAllocation> {
        if self.pending.contains_key(&new.session_id) {
            return Err(StoreError::SessionExists(new.session_id.clone()));
        }

        let identity = self.pool.reserve()?;
        let allocation = PendingAllocation {
            session_id: new.session_id.clone(),
            identity,
            owner_id: new.owner_id,
            plan: new.plan.clone(),
            created_at: new.created_at,
            expires_at: new.expires_at,
            state: AllocationState::Awaiting,
        };
        self.pending
            .insert(new.session_id.clone(), allocation.clone());
        Ok(allocation)
    }

    pub(crate) fn claim(
        &mut self,
        session: &SessionId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<ClaimOutcome> {
        let allocation = self
            .pending
            .get_mut(session)
            .ok_or_else(|| StoreError::NotFound(format!("allocation {}", session)))?;

        match &allocation.state {
            AllocationState::Awaiting => {
                allocation.state = AllocationState::Provisioning { claimed_at: now };
                Ok(ClaimOutcome::Claimed(allocation.clone()))
            }
            AllocationState::Provisioning { claimed_at } if *claimed_at + lease <= now => {
                allocation.state = AllocationState::Provisioning { claimed_at: now };
                Ok(ClaimOutcome::Claimed(allocation.clone()))
            }
            AllocationState::Provisioning { .. } => {
                Ok(ClaimOutcome::InProgress(allocation.clone()))
            }
            AllocationState::Consumed { record_id, .. } => self
                .records
                .get(record_id)
                .cloned()
                .map(ClaimOutcome::Consumed)
                .ok_or_else(|| {
                    StoreError::InvalidData(format!(
                        "allocation {} points at missing {}",
                        session, record_id
                    ))
                }),
            AllocationState::Failed { .. } | AllocationState::Expired { .. } => {
                Ok(ClaimOutcome::Closed(allocation.clone()))
            }
        }
    }

    pub(crate) fn unclaim(&mut self, session: &SessionId) -> StoreResult<()> {
        let allocation = self
            .pending
            .get_mut(session)
            .ok_or_else(|| StoreError::NotFound(format!("allocation {}", session)))?;
        if matches!(allocation.state, AllocationState::Provisioning { .. }) {
            allocation.state = AllocationState::Awaiting;
        }
        Ok(())
    }

    pub(crate) fn promote(
        &mut self,
        session: &SessionId,
        runtime_id: &RuntimeId,
        plan: &PlanId,
        now: DateTime<Utc>,
    ) -> StoreResult<FleetRecord> {
        let allocation = self
            .pending
            .get(session)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("allocation {}", session)))?;

        match &allocation.state {
            AllocationState::Awaiting | AllocationState::Provisioning { .. } => {}
            AllocationState::Consumed { record_id, .. } => {
                return Err(StoreError::AlreadyConsumed {
                    session: session.clone(),
                    record_id: *record_id,
                })
            }
            closed => {
                return Err(StoreError::AllocationClosed {
                    session: session.clone(),
                    state: closed.label().to_string(),
                })
            }
        }

        if self
            .records
            .values()
            .any(|r| r.is_active() && &r.runtime_id == runtime_id)
        {
            return Err(StoreError::Conflict(format!(
                "runtime id {} already belongs to a live record",
                runtime_id
            )));
        }

        self.pool.mark_assigned(&allocation.identity)?;

        let record = FleetRecord {
            id: RecordId::generate(),
            name: allocation.identity.name.clone(),
            port: allocation.identity.port,
            status: FleetStatus::Running,
            plan: plan.clone(),
            runtime_id: runtime_id.clone(),
            owner_id: allocation.owner_id,
            session_id: session.clone(),
            created_at: now,
            updated_at: now,
        };

        self.pending.insert(
            session.clone(),
            PendingAllocation {
                state: AllocationState::Consumed {
                    consumed_at: now,
                    record_id: record.id,
                },
                ..allocation
            },
        );
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    pub(crate) fn fail(
        &mut self,
        session: &SessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<PendingAllocation> {
        let allocation = self
            .pending
            .get(session)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("allocation {}", session)))?;

        match &allocation.state {
            AllocationState::Awaiting | AllocationState::Provisioning { .. } => {}
            AllocationState::Failed { .. } => return Ok(allocation),
            AllocationState::Consumed { record_id, .. } => {
                return Err(StoreError::AlreadyConsumed {
                    session: session.clone(),
                    record_id: *record_id,
                })
            }
            AllocationState::Expired { .. } => {
                return Err(StoreError::AllocationClosed {
                    session: session.clone(),
                    state: allocation.state.label().to_string(),
                })
            }
        }

        self.pool.release(&allocation.identity)?;
        let failed = PendingAllocation {
            state: AllocationState::Failed {
                failed_at: now,
                reason: reason.to_string(),
            },
            ..allocation
        };
        self.pending.insert(session.clone(), failed.clone());
        Ok(failed)
    }

    pub(crate) fn expire(
        &mut self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Vec<PendingAllocation>> {
        let stale: Vec<PendingAllocation> = self
            .pending
            .values()
            .filter(|p| is_expirable(p, now, lease))
            .cloned()
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for allocation in stale {
            self.pool.release(&allocation.identity)?;
            let closed = PendingAllocation {
                state: AllocationState::Expired { expired_at: now },
                ..allocation
            };
            self.pending
                .insert(closed.session_id.clone(), closed.clone());
            expired.push(closed);
        }
        Ok(expired)
    }

    pub(crate) fn update_status(
        &mut self,
        id: &RecordId,
        expected: FleetStatus,
        status: FleetStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<FleetRecord> {
        if status == FleetStatus::Removed {
            return Err(StoreError::InvalidState(
                "removal must go through delete_or_mark_removed".to_string(),
            ));
        }
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.status != expected {
            return Err(StoreError::StatusConflict {
                record_id: *id,
                expected,
                actual: record.status,
            });
        }
        record.status = status;
        record.updated_at = now;
        Ok(record.clone())
    }

    pub(crate) fn mark_removed(
        &mut self,
        id: &RecordId,
        now: DateTime<Utc>,
    ) -> StoreResult<RemovalOutcome> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.status == FleetStatus::Removed {
            return Ok(RemovalOutcome::AlreadyRemoved(record.clone()));
        }

        self.pool.release(&record.identity())?;
        record.status = FleetStatus::Removed;
        record.updated_at = now;
        Ok(RemovalOutcome::Removed(record.clone()))
    }
}

/// Awaiting past the deadline, or a claim that outlived both its lease and the deadline.
fn is_expirable(allocation: &PendingAllocation, now: DateTime<Utc>, lease: Duration) -> bool {
    match &allocation.state {
        AllocationState::Awaiting => allocation.expires_at <= now,
        AllocationState::Provisioning { claimed_at } => {
            allocation.expires_at <= now && *claimed_at + lease <= now
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_pool::SlotState;
    use berth_types::OwnerId;

    fn state() -> FleetState {
        FleetState::new(PoolConfig {
            min_port: 25566,
            max_port: 25568,
            ..PoolConfig::default()
        })
        .unwrap()
    }

    fn new_pending(session: &str) -> NewPending {
        let now = Utc::now();
        NewPending {
            session_id: SessionId::new(session),
            owner_id: OwnerId::new(42),
            plan: PlanId::new("planB"),
            created_at: now,
            expires_at: now + Duration::minutes(30),
        }
    }

    #[test]
    fn test_promote_assigns_identity() {
        let mut state = state();
        let pending = state.create_pending(&new_pending("cs_1")).unwrap();
        let record = state
            .promote(
                &pending.session_id,
                &RuntimeId::new("c1"),
                &PlanId::new("planB"),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(record.port, pending.identity.port);
        assert_eq!(state.pool.state_of(record.port), Some(SlotState::Assigned));

        let err = state
            .promote(
                &pending.session_id,
                &RuntimeId::new("c2"),
                &PlanId::new("planB"),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyConsumed { .. }));
    }

    #[test]
    fn test_runtime_id_is_not_reused_by_live_records() {
        let mut state = state();
        let a = state.create_pending(&new_pending("cs_a")).unwrap();
        let b = state.create_pending(&new_pending("cs_b")).unwrap();
        let runtime_id = RuntimeId::new("c1");
        let plan = PlanId::new("planB");
        state
            .promote(&a.session_id, &runtime_id, &plan, Utc::now())
            .unwrap();
        let err = state
            .promote(&b.session_id, &runtime_id, &plan, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // The losing allocation keeps its reservation.
        assert_eq!(state.pool.state_of(b.identity.port), Some(SlotState::Reserved));
    }

    #[test]
    fn test_claim_lease_takeover() {
        let mut state = state();
        let pending = state.create_pending(&new_pending("cs_1")).unwrap();
        let t0 = Utc::now();
        let lease = Duration::minutes(5);

        assert!(matches!(
            state.claim(&pending.session_id, t0, lease).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            state.claim(&pending.session_id, t0, lease).unwrap(),
            ClaimOutcome::InProgress(_)
        ));
        assert!(matches!(
            state
                .claim(&pending.session_id, t0 + Duration::minutes(6), lease)
                .unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[test]
    fn test_fail_is_idempotent_and_releases_once() {
        let mut state = state();
        let pending = state.create_pending(&new_pending("cs_1")).unwrap();
        state.fail(&pending.session_id, "boom", Utc::now()).unwrap();
        assert_eq!(state.pool.state_of(pending.identity.port), Some(SlotState::Free));

        let again = state.fail(&pending.session_id, "boom", Utc::now()).unwrap();
        assert!(matches!(again.state, AllocationState::Failed { .. }));
        assert_eq!(state.pool.usage().free, 3);
    }

    #[test]
    fn test_removed_is_not_a_status_update() {
        let mut state = state();
        let pending = state.create_pending(&new_pending("cs_1")).unwrap();
        let record = state
            .promote(
                &pending.session_id,
                &RuntimeId::new("c1"),
                &PlanId::new("planB"),
                Utc::now(),
            )
            .unwrap();
        let err = state
            .update_status(
                &record.id,
                FleetStatus::Running,
                FleetStatus::Removed,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }
}
