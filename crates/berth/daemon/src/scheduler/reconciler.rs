//! Periodic reconciliation and expiry loop

use berth_control::{FleetEngine, ReconcileReport};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::SchedulerConfig;

/// Drives the reconciler and the allocation expiry on fixed intervals
pub struct Scheduler {
    config: SchedulerConfig,
    engine: FleetEngine,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, engine: FleetEngine) -> Self {
        Self { config, engine }
    }

    /// Run until the shutdown channel flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            tracing::info!("Scheduler disabled");
            return;
        }

        let mut reconcile = interval(Duration::from_secs(self.config.reconcile_interval_secs));
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut expiry = interval(Duration::from_secs(self.config.expiry_interval_secs));
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            reconcile_interval_secs = self.config.reconcile_interval_secs,
            expiry_interval_secs = self.config.expiry_interval_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    self.reconcile_once().await;
                }
                _ = expiry.tick() => {
                    self.expire_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// One reconciliation sweep. Failures are logged, never propagated.
    pub async fn reconcile_once(&self) -> Option<ReconcileReport> {
        match self.engine.reconciler.reconcile().await {
            Ok(report) => {
                if report.corrected > 0 || report.removed > 0 || report.orphans_removed > 0 {
                    tracing::info!(
                        checked = report.checked,
                        corrected = report.corrected,
                        removed = report.removed,
                        orphans_removed = report.orphans_removed,
                        "Reconciliation applied changes"
                    );
                } else {
                    tracing::debug!(checked = report.checked, "Reconciliation found no drift");
                }
                for failure in &report.errors {
                    tracing::warn!(
                        runtime_id = %failure.runtime_id,
                        error = %failure.error,
                        "Reconciliation left an entry unsettled"
                    );
                }
                Some(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "Reconciliation failed");
                None
            }
        }
    }

    /// One expiry sweep; returns how many allocations were released.
    pub async fn expire_once(&self) -> usize {
        match self.engine.provisioner.expire_stale(Utc::now()).await {
            Ok(expired) => {
                if !expired.is_empty() {
                    tracing::info!(count = expired.len(), "Expired unconfirmed allocations");
                }
                expired.len()
            }
            Err(e) => {
                tracing::error!(error = %e, "Expiry sweep failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_pool::PoolConfig;
    use berth_runtime::SimulatedRuntime;
    use berth_store::{FleetStore, InMemoryFleetStore};
    use berth_types::{FleetStatus, OwnerId, PaymentEvent, PlanId};
    use std::sync::Arc;

    fn engine() -> (FleetEngine, Arc<SimulatedRuntime>) {
        let store = Arc::new(InMemoryFleetStore::new(PoolConfig::default()).unwrap());
        let runtime = Arc::new(SimulatedRuntime::new());
        let engine = FleetEngine::builder()
            .with_store(store)
            .with_runtime(runtime.clone())
            .build()
            .unwrap();
        (engine, runtime)
    }

    #[tokio::test]
    async fn test_reconcile_once_heals_missing_container() {
        let (engine, runtime) = engine();
        let pending = engine
            .provisioner
            .initiate(OwnerId::new(1), PlanId::new("planA"), None)
            .await
            .unwrap();
        let outcome = engine
            .provisioner
            .confirm(&PaymentEvent::purchase_confirmed(
                pending.session_id,
                PlanId::new("planA"),
            ))
            .await
            .unwrap();
        let record = outcome.record().cloned().unwrap();
        runtime.remove_out_of_band(&record.runtime_id).await;

        let scheduler = Scheduler::new(SchedulerConfig::default(), engine.clone());
        let report = scheduler.reconcile_once().await.unwrap();
        assert_eq!(report.removed, 1);

        let stored = engine.store().get_by_id(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FleetStatus::Removed);
    }

    #[tokio::test]
    async fn test_expire_once_with_nothing_stale() {
        let (engine, _) = engine();
        engine
            .provisioner
            .initiate(OwnerId::new(1), PlanId::new("planA"), None)
            .await
            .unwrap();

        let scheduler = Scheduler::new(SchedulerConfig::default(), engine);
        assert_eq!(scheduler.expire_once().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (engine, _) = engine();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Scheduler::new(SchedulerConfig::default(), engine).run(rx));

        tokio::time::sleep(Duration::from_secs(95)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_scheduler_returns_immediately() {
        let (engine, _) = engine();
        let (_tx, rx) = watch::channel(false);
        let config = SchedulerConfig {
            enabled: false,
            ..SchedulerConfig::default()
        };
        Scheduler::new(config, engine).run(rx).await;
    }
}
