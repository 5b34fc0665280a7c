//! Runtime reconciler
//!
//! Brings the store in line with the runtime. For each record that should
//! be backed by a container:
//!
//! - live status matches: nothing to do
//! - live status differs: the record takes the runtime's status
//! - container absent: the record goes through drift healing
//!
//! A failure on one record is reported and the sweep carries on; the next
//! sweep retries it.

use std::collections::HashSet;
use std::sync::Arc;

use berth_runtime::RuntimeClient;
use berth_store::{FleetStore, RemovalOutcome, StoreError};
use berth_types::{FleetRecord, FleetStatus, OwnerId, RecordId, RuntimeId};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::ReconcilerConfig;
use crate::error::{FleetError, Result};
use crate::healing::DriftHealer;

/// What reconciliation did to one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    InSync,

    /// Status was corrected to match the runtime.
    Corrected { from: FleetStatus, to: FleetStatus },

    /// Container was gone; the record is now Removed.
    Removed,

    /// The record changed underneath the sweep; left for the next one.
    Skipped,
}

/// A record or container the sweep could not settle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    pub record_id: Option<RecordId>,
    pub runtime_id: RuntimeId,
    pub error: String,
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub in_sync: usize,
    pub corrected: usize,
    pub removed: usize,
    pub skipped: usize,
    pub orphans_removed: usize,
    pub errors: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    fn record(&mut self, outcome: RecordOutcome) {
        self.checked += 1;
        match outcome {
            RecordOutcome::InSync => self.in_sync += 1,
            RecordOutcome::Corrected { .. } => self.corrected += 1,
            RecordOutcome::Removed => self.removed += 1,
            RecordOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Reconciles fleet records against runtime ground truth.
pub struct Reconciler {
    store: Arc<dyn FleetStore>,
    runtime: Arc<dyn RuntimeClient>,
    healer: DriftHealer,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn FleetStore>,
        runtime: Arc<dyn RuntimeClient>,
        healer: DriftHealer,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            healer,
            config,
        }
    }

    /// Sweep every backed record, then optionally remove orphaned containers.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let records = self.store.list_all().await?;
        let mut report = self.sweep(records).await;

        if self.config.remove_orphans {
            self.remove_orphans(&mut report).await?;
        }

        info!(
            checked = report.checked,
            corrected = report.corrected,
            removed = report.removed,
            orphans_removed = report.orphans_removed,
            errors = report.errors.len(),
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    /// Sweep only the records of one owner, e.g. before showing their fleet.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn reconcile_owner(&self, owner: OwnerId) -> Result<ReconcileReport> {
        let records = self.store.list_by_owner(owner).await?;
        Ok(self.sweep(records).await)
    }

    /// Reconcile one record.
    pub async fn reconcile_record(&self, record: &FleetRecord) -> Result<RecordOutcome> {
        let info = match self.runtime.inspect(&record.runtime_id).await {
            Ok(info) => info,
            Err(err) if err.is_not_found() => {
                return match self.healer.container_missing(record).await? {
                    RemovalOutcome::Removed(_) => Ok(RecordOutcome::Removed),
                    RemovalOutcome::AlreadyRemoved(_) => Ok(RecordOutcome::Skipped),
                };
            }
            Err(err) => return Err(err.into()),
        };

        let live = info.status.as_fleet_status();
        if live == record.status {
            return Ok(RecordOutcome::InSync);
        }

        match self
            .store
            .update_status(&record.id, record.status, live, Utc::now())
            .await
        {
            Ok(_) => {
                info!(
                    record_id = %record.id,
                    from = %record.status,
                    to = %live,
                    "status corrected from runtime"
                );
                Ok(RecordOutcome::Corrected {
                    from: record.status,
                    to: live,
                })
            }
            Err(StoreError::StatusConflict { .. }) => {
                debug!(record_id = %record.id, "record changed during sweep");
                Ok(RecordOutcome::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn sweep(&self, records: Vec<FleetRecord>) -> ReconcileReport {
        let backed: Vec<FleetRecord> = records
            .into_iter()
            .filter(|r| r.status.is_backed())
            .collect();

        let outcomes: Vec<(FleetRecord, Result<RecordOutcome>)> = stream::iter(backed)
            .map(|record| async move {
                let outcome = self.reconcile_record(&record).await;
                (record, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        for (record, outcome) in outcomes {
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    warn!(record_id = %record.id, error = %err, "could not reconcile record");
                    report.checked += 1;
                    report.errors.push(ReconcileFailure {
                        record_id: Some(record.id),
                        runtime_id: record.runtime_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Remove managed containers that neither a live record nor an open
    /// allocation accounts for.
    async fn remove_orphans(&self, report: &mut ReconcileReport) -> Result<()> {
        let containers = self
            .runtime
            .list(&self.config.name_prefix)
            .await
            .map_err(FleetError::from)?;

        let known: HashSet<RuntimeId> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(FleetRecord::is_active)
            .map(|r| r.runtime_id)
            .collect();
        let in_flight: HashSet<String> = self
            .store
            .list_open_pending()
            .await?
            .into_iter()
            .map(|p| p.identity.name)
            .collect();

        for container in containers {
            if known.contains(&container.runtime_id) || in_flight.contains(&container.name) {
                continue;
            }
            match self.runtime.remove(&container.runtime_id).await {
                Ok(()) => {
                    info!(
                        name = %container.name,
                        runtime_id = %container.runtime_id.short(),
                        "orphaned container removed"
                    );
                    report.orphans_removed += 1;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => report.errors.push(ReconcileFailure {
                    record_id: None,
                    runtime_id: container.runtime_id.clone(),
                    error: err.to_string(),
                }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_pool::PoolConfig;
    use berth_runtime::{LiveStatus, Operation, RuntimeError, RuntimeTemplate, SimulatedRuntime};
    use berth_store::{InMemoryFleetStore, NewPending};
    use berth_types::{MemoryLimit, PlanId, SessionId};

    struct Harness {
        store: Arc<InMemoryFleetStore>,
        runtime: Arc<SimulatedRuntime>,
        reconciler: Reconciler,
    }

    fn harness(config: ReconcilerConfig) -> Harness {
        let store = Arc::new(InMemoryFleetStore::new(PoolConfig::default()).unwrap());
        let runtime = Arc::new(SimulatedRuntime::new());
        let reconciler = Reconciler::new(
            store.clone(),
            runtime.clone(),
            DriftHealer::new(store.clone()),
            config,
        );
        Harness {
            store,
            runtime,
            reconciler,
        }
    }

    async fn provision(h: &Harness, session: &str, owner: i64) -> FleetRecord {
        let now = Utc::now();
        let pending = h
            .store
            .create_pending(NewPending {
                session_id: SessionId::new(session),
                owner_id: OwnerId::new(owner),
                plan: PlanId::new("planA"),
                created_at: now,
                expires_at: now + chrono::Duration::minutes(30),
            })
            .await
            .unwrap();
        let spec = RuntimeTemplate::default()
            .container_spec(&pending.identity, MemoryLimit::parse("2g").unwrap());
        let runtime_id = h.runtime.create(&spec).await.unwrap();
        h.store
            .promote_pending_to_record(&pending.session_id, runtime_id, PlanId::new("planA"), now)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_in_sync_records_are_untouched() {
        let h = harness(ReconcilerConfig::default());
        let record = provision(&h, "cs_1", 1).await;

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.in_sync, 1);
        let stored = h.store.get_by_id(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, record.updated_at);
    }

    #[tokio::test]
    async fn test_status_follows_runtime() {
        let h = harness(ReconcilerConfig::default());
        let record = provision(&h, "cs_1", 1).await;
        h.runtime.set_status(&record.runtime_id, LiveStatus::Exited).await;

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.corrected, 1);
        let stored = h.store.get_by_id(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FleetStatus::Stopped);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_sweep() {
        let h = harness(ReconcilerConfig {
            concurrency: 1,
            ..ReconcilerConfig::default()
        });
        let first = provision(&h, "cs_1", 1).await;
        let second = provision(&h, "cs_2", 1).await;
        h.runtime.set_status(&first.runtime_id, LiveStatus::Exited).await;
        h.runtime.set_status(&second.runtime_id, LiveStatus::Exited).await;
        h.runtime
            .fail_next(Operation::Inspect, RuntimeError::Unavailable("flaky".into()))
            .await;

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.corrected, 1);

        // The next sweep picks up the record that failed.
        let report = h.reconciler.reconcile().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.corrected, 1);
    }

    #[tokio::test]
    async fn test_reconcile_owner_is_scoped() {
        let h = harness(ReconcilerConfig::default());
        provision(&h, "cs_1", 1).await;
        let other = provision(&h, "cs_2", 2).await;
        h.runtime.remove_out_of_band(&other.runtime_id).await;

        let report = h.reconciler.reconcile_owner(OwnerId::new(1)).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(
            h.store.get_by_id(&other.id).await.unwrap().unwrap().status,
            FleetStatus::Running
        );
    }

    #[tokio::test]
    async fn test_orphan_sweep_spares_known_and_in_flight_containers() {
        let h = harness(ReconcilerConfig {
            remove_orphans: true,
            ..ReconcilerConfig::default()
        });
        let record = provision(&h, "cs_1", 1).await;

        // An allocation whose container exists but is not promoted yet.
        let now = Utc::now();
        let in_flight = h
            .store
            .create_pending(NewPending {
                session_id: SessionId::new("cs_2"),
                owner_id: OwnerId::new(1),
                plan: PlanId::new("planA"),
                created_at: now,
                expires_at: now + chrono::Duration::minutes(30),
            })
            .await
            .unwrap();
        h.runtime
            .insert_unmanaged(&in_flight.identity.name, in_flight.identity.port)
            .await;
        let stray = h.runtime.insert_unmanaged("srv_999999", 30000).await;
        h.runtime.insert_unmanaged("postgres", 5432).await;

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(h.runtime.status_of(&stray).await.is_none());
        assert!(h.runtime.status_of(&record.runtime_id).await.is_some());
        assert_eq!(h.runtime.container_count().await, 3);
    }
}
