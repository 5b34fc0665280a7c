//! Drift healing for records whose container disappeared.
//!
//! Both the reconciler and the lifecycle controller end up here when the
//! runtime reports a container as absent. The runtime is authoritative, so
//! the record is marked Removed and its identity goes back to the pool.
//! Store removal is idempotent; two callers healing the same record release
//! the identity once.

use std::sync::Arc;

use berth_store::{FleetStore, RemovalOutcome};
use berth_types::FleetRecord;
use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;

/// Converges a record to Removed after its container vanished.
#[derive(Clone)]
pub struct DriftHealer {
    store: Arc<dyn FleetStore>,
}

impl DriftHealer {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    pub async fn container_missing(&self, record: &FleetRecord) -> Result<RemovalOutcome> {
        warn!(
            record_id = %record.id,
            name = %record.name,
            port = record.port,
            runtime_id = %record.runtime_id.short(),
            "orphan detected: backing container is gone"
        );

        let outcome = self
            .store
            .delete_or_mark_removed(&record.id, Utc::now())
            .await?;

        match &outcome {
            RemovalOutcome::Removed(removed) => info!(
                record_id = %removed.id,
                identity = %removed.identity(),
                "record removed and identity released"
            ),
            RemovalOutcome::AlreadyRemoved(_) => info!(
                record_id = %record.id,
                "record was already removed"
            ),
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_pool::PoolConfig;
    use berth_store::{InMemoryFleetStore, NewPending};
    use berth_types::{OwnerId, PlanId, RuntimeId, SessionId};

    #[tokio::test]
    async fn test_healing_twice_releases_once() {
        let store = Arc::new(InMemoryFleetStore::new(PoolConfig::default()).unwrap());
        let now = Utc::now();
        let pending = store
            .create_pending(NewPending {
                session_id: SessionId::new("cs_1"),
                owner_id: OwnerId::new(1),
                plan: PlanId::new("planA"),
                created_at: now,
                expires_at: now + chrono::Duration::minutes(30),
            })
            .await
            .unwrap();
        let record = store
            .promote_pending_to_record(
                &pending.session_id,
                RuntimeId::new("rt-1"),
                PlanId::new("planA"),
                now,
            )
            .await
            .unwrap();

        let healer = DriftHealer::new(store.clone());
        assert!(matches!(
            healer.container_missing(&record).await.unwrap(),
            RemovalOutcome::Removed(_)
        ));
        assert!(matches!(
            healer.container_missing(&record).await.unwrap(),
            RemovalOutcome::AlreadyRemoved(_)
        ));

        let usage = store.pool_usage().await.unwrap();
        assert_eq!(usage.free, usage.capacity);
    }
}
