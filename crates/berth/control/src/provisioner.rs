//! Provisioning state machine
//!
//! An allocation moves `Awaiting → Provisioning → Consumed` on success,
//! `→ Failed` when the runtime refuses the container, and `Awaiting →
//! Expired` when no confirmation arrives in time.
//!
//! Identity reservation and container creation are separate steps: the
//! runtime is never called inside a store transaction. Exactly-once
//! creation comes from the claim taken on the allocation before the runtime
//! call; a second delivery of the same confirmation either replays the
//! consumed record or sees the claim in progress.

use std::sync::Arc;

use berth_runtime::{RuntimeClient, RuntimeError, RuntimeTemplate};
use berth_store::{ClaimOutcome, FleetStore, NewPending, StoreError};
use berth_types::{
    AllocationState, FleetRecord, OwnerId, PaymentEvent, PendingAllocation, PlanId, PlanTable,
    RuntimeId, SessionId,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::ProvisioningConfig;
use crate::error::{FleetError, Result};

/// How a confirmation was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// This call created the container and the record.
    Provisioned(FleetRecord),

    /// The session was confirmed before; the existing record is returned.
    Replayed(FleetRecord),

    /// Another caller is provisioning this session right now.
    InProgress(SessionId),

    /// Not a purchase confirmation.
    Ignored,
}

impl ConfirmOutcome {
    pub fn record(&self) -> Option<&FleetRecord> {
        match self {
            ConfirmOutcome::Provisioned(record) | ConfirmOutcome::Replayed(record) => Some(record),
            ConfirmOutcome::InProgress(_) | ConfirmOutcome::Ignored => None,
        }
    }
}

/// Drives allocations from reservation to a running container.
pub struct Provisioner {
    store: Arc<dyn FleetStore>,
    runtime: Arc<dyn RuntimeClient>,
    plans: PlanTable,
    template: RuntimeTemplate,
    config: ProvisioningConfig,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn FleetStore>,
        runtime: Arc<dyn RuntimeClient>,
        plans: PlanTable,
        template: RuntimeTemplate,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            plans,
            template,
            config,
        }
    }

    pub fn plans(&self) -> &PlanTable {
        &self.plans
    }

    /// Reserve an identity for `owner` and open an allocation awaiting payment.
    ///
    /// The returned session id is the client reference handed to the payment
    /// provider. Re-initiating with a session id the same owner already
    /// holds returns the existing allocation.
    #[instrument(skip(self), fields(owner = %owner, plan = %plan))]
    pub async fn initiate(
        &self,
        owner: OwnerId,
        plan: PlanId,
        session: Option<SessionId>,
    ) -> Result<PendingAllocation> {
        if !self.plans.contains(&plan) {
            return Err(FleetError::UnknownPlan(plan));
        }

        let session_id = session.unwrap_or_else(SessionId::generate);
        let now = Utc::now();
        let new = NewPending {
            session_id: session_id.clone(),
            owner_id: owner,
            plan,
            created_at: now,
            expires_at: now + self.config.reservation_ttl(),
        };

        match self.store.create_pending(new).await {
            Ok(allocation) => {
                info!(
                    session_id = %allocation.session_id,
                    name = %allocation.identity.name,
                    port = allocation.identity.port,
                    "identity reserved"
                );
                Ok(allocation)
            }
            Err(StoreError::SessionExists(_)) => {
                let existing = self
                    .store
                    .get_pending(&session_id)
                    .await?
                    .ok_or_else(|| FleetError::SessionNotFound(session_id.clone()))?;
                if existing.owner_id != owner {
                    return Err(FleetError::SessionConflict(session_id));
                }
                debug!(session_id = %session_id, "allocation already initiated");
                Ok(existing)
            }
            Err(err) => {
                if err.is_exhausted() {
                    warn!("identity pool exhausted");
                }
                Err(err.into())
            }
        }
    }

    /// Apply a verified payment event. Safe to call any number of times.
    pub async fn confirm(&self, event: &PaymentEvent) -> Result<ConfirmOutcome> {
        if !event.is_purchase_confirmed() {
            debug!(kind = %event.kind, session_id = %event.session_id, "ignoring event");
            return Ok(ConfirmOutcome::Ignored);
        }
        self.confirm_session(&event.session_id, &event.resolved_plan_id)
            .await
    }

    /// Create the container for `session` using the resources of `plan`.
    #[instrument(skip(self), fields(session_id = %session, plan = %plan))]
    pub async fn confirm_session(
        &self,
        session: &SessionId,
        plan: &PlanId,
    ) -> Result<ConfirmOutcome> {
        let claim = match self
            .store
            .claim_pending(session, Utc::now(), self.config.claim_lease())
            .await
        {
            Ok(claim) => claim,
            Err(StoreError::NotFound(_)) => return Err(FleetError::SessionNotFound(session.clone())),
            Err(err) => return Err(err.into()),
        };

        let allocation = match claim {
            ClaimOutcome::Claimed(allocation) => allocation,
            ClaimOutcome::Consumed(record) => {
                info!(record_id = %record.id, "duplicate confirmation, returning existing record");
                return Ok(ConfirmOutcome::Replayed(record));
            }
            ClaimOutcome::InProgress(_) => {
                debug!("confirmation already in progress");
                return Ok(ConfirmOutcome::InProgress(session.clone()));
            }
            ClaimOutcome::Closed(allocation) => return Err(closed_error(&allocation)),
        };

        let memory_limit = match self.plans.resolve(plan) {
            Ok(spec) => spec.memory_limit.clone(),
            Err(_) => {
                warn!("confirmation names an unknown plan, failing allocation");
                self.store
                    .fail_pending(session, &format!("unknown plan {}", plan), Utc::now())
                    .await?;
                return Err(FleetError::UnknownPlan(plan.clone()));
            }
        };
        if &allocation.plan != plan {
            info!(initiated = %allocation.plan, "provisioning the resolved plan");
        }

        let spec = self
            .template
            .container_spec(&allocation.identity, memory_limit);
        let timeout = self.config.create_timeout();
        let created = tokio::time::timeout(timeout, self.runtime.create(&spec))
            .await
            .unwrap_or(Err(RuntimeError::Timeout(timeout)));

        let runtime_id = match created {
            Ok(runtime_id) => runtime_id,
            Err(RuntimeError::Unavailable(reason)) => {
                warn!(%reason, "runtime unavailable, keeping reservation");
                self.store.unclaim_pending(session).await?;
                return Err(FleetError::RuntimeUnavailable(reason));
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(%reason, identity = %allocation.identity, "container creation failed, releasing identity");
                // The create may have got as far as registering the name.
                self.discard(&RuntimeId::new(spec.name.clone())).await;
                self.store
                    .fail_pending(session, &reason, Utc::now())
                    .await?;
                return Err(FleetError::RuntimeCreateFailed {
                    session: session.clone(),
                    reason,
                });
            }
        };

        match self
            .store
            .promote_pending_to_record(session, runtime_id.clone(), plan.clone(), Utc::now())
            .await
        {
            Ok(record) => {
                info!(
                    record_id = %record.id,
                    name = %record.name,
                    port = record.port,
                    runtime_id = %record.runtime_id.short(),
                    "server provisioned"
                );
                Ok(ConfirmOutcome::Provisioned(record))
            }
            Err(StoreError::AlreadyConsumed { record_id, .. }) => {
                // A stale claim was taken over and the other caller finished first.
                self.discard(&runtime_id).await;
                let record = self
                    .store
                    .get_by_id(&record_id)
                    .await?
                    .ok_or(FleetError::RecordNotFound(record_id))?;
                Ok(ConfirmOutcome::Replayed(record))
            }
            Err(StoreError::AllocationClosed { .. }) => {
                self.discard(&runtime_id).await;
                let allocation = self
                    .store
                    .get_pending(session)
                    .await?
                    .ok_or_else(|| FleetError::SessionNotFound(session.clone()))?;
                Err(closed_error(&allocation))
            }
            Err(err) => {
                warn!(error = %err, "promotion failed after create, rolling back");
                self.discard(&runtime_id).await;
                if let Err(fail_err) = self
                    .store
                    .fail_pending(session, &err.to_string(), Utc::now())
                    .await
                {
                    warn!(error = %fail_err, "could not mark allocation failed");
                }
                Err(err.into())
            }
        }
    }

    /// Expire allocations past their deadline and release their identities.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<PendingAllocation>> {
        let expired = self
            .store
            .expire_pending(now, self.config.claim_lease())
            .await?;
        for allocation in &expired {
            info!(
                session_id = %allocation.session_id,
                identity = %allocation.identity,
                "allocation expired, identity released"
            );
        }
        Ok(expired)
    }

    pub async fn allocation(&self, session: &SessionId) -> Result<PendingAllocation> {
        self.store
            .get_pending(session)
            .await?
            .ok_or_else(|| FleetError::SessionNotFound(session.clone()))
    }

    /// Best-effort removal of a container that will not get a record.
    async fn discard(&self, runtime_id: &RuntimeId) {
        match self.runtime.remove(runtime_id).await {
            Ok(()) => debug!(runtime_id = %runtime_id.short(), "discarded unused container"),
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!(
                runtime_id = %runtime_id.short(),
                error = %err,
                "could not discard unused container"
            ),
        }
    }
}

fn closed_error(allocation: &PendingAllocation) -> FleetError {
    match &allocation.state {
        AllocationState::Failed { reason, .. } => FleetError::AllocationFailed {
            session: allocation.session_id.clone(),
            reason: reason.clone(),
        },
        _ => FleetError::AllocationExpired(allocation.session_id.clone()),
    }
}
