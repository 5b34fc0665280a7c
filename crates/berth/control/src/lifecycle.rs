//! Owner-facing lifecycle operations on provisioned servers.

use std::sync::Arc;

use berth_runtime::RuntimeClient;
use berth_store::{FleetStore, StoreError};
use berth_types::{FleetRecord, FleetStatus, OwnerId, RecordId};
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::error::{FleetError, Result};
use crate::healing::DriftHealer;

#[derive(Debug, Clone, Copy)]
enum Transition {
    Start,
    Stop,
}

impl Transition {
    fn name(self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Stop => "stop",
        }
    }

    fn required(self) -> FleetStatus {
        match self {
            Transition::Start => FleetStatus::Stopped,
            Transition::Stop => FleetStatus::Running,
        }
    }

    fn target(self) -> FleetStatus {
        match self {
            Transition::Start => FleetStatus::Running,
            Transition::Stop => FleetStatus::Stopped,
        }
    }
}

/// Start, stop and remove servers on behalf of their owners.
pub struct LifecycleController {
    store: Arc<dyn FleetStore>,
    runtime: Arc<dyn RuntimeClient>,
    healer: DriftHealer,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn FleetStore>,
        runtime: Arc<dyn RuntimeClient>,
        healer: DriftHealer,
    ) -> Self {
        Self {
            store,
            runtime,
            healer,
        }
    }

    /// Fetch a record the caller owns.
    pub async fn get(&self, id: &RecordId, caller: OwnerId) -> Result<FleetRecord> {
        let record = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(FleetError::RecordNotFound(*id))?;
        if !record.is_owned_by(caller) {
            return Err(FleetError::AuthorizationDenied {
                record_id: *id,
                caller,
            });
        }
        Ok(record)
    }

    /// The caller's servers, oldest first.
    pub async fn list(&self, owner: OwnerId) -> Result<Vec<FleetRecord>> {
        Ok(self.store.list_by_owner(owner).await?)
    }

    /// Every server of every owner, removed ones included. Operator view.
    pub async fn list_all(&self) -> Result<Vec<FleetRecord>> {
        Ok(self.store.list_all().await?)
    }

    #[instrument(skip(self), fields(record_id = %id, caller = %caller))]
    pub async fn start(&self, id: &RecordId, caller: OwnerId) -> Result<FleetRecord> {
        self.transition(id, caller, Transition::Start).await
    }

    #[instrument(skip(self), fields(record_id = %id, caller = %caller))]
    pub async fn stop(&self, id: &RecordId, caller: OwnerId) -> Result<FleetRecord> {
        self.transition(id, caller, Transition::Stop).await
    }

    /// Remove the container and mark the record Removed. Repeating the call
    /// returns the removed record.
    #[instrument(skip(self), fields(record_id = %id, caller = %caller))]
    pub async fn remove(&self, id: &RecordId, caller: OwnerId) -> Result<FleetRecord> {
        let record = self.get(id, caller).await?;
        if record.status == FleetStatus::Removed {
            return Ok(record);
        }

        match self.runtime.remove(&record.runtime_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!(runtime_id = %record.runtime_id.short(), "container already absent");
            }
            Err(err) => return Err(err.into()),
        }

        let removed = self
            .store
            .delete_or_mark_removed(id, Utc::now())
            .await?
            .into_record();
        info!(identity = %removed.identity(), "server removed");
        Ok(removed)
    }

    async fn transition(
        &self,
        id: &RecordId,
        caller: OwnerId,
        transition: Transition,
    ) -> Result<FleetRecord> {
        let record = self.get(id, caller).await?;
        if record.status != transition.required() {
            return Err(FleetError::InvalidStateTransition {
                record_id: *id,
                operation: transition.name(),
                status: record.status,
            });
        }

        let result = match transition {
            Transition::Start => self.runtime.start(&record.runtime_id).await,
            Transition::Stop => self.runtime.stop(&record.runtime_id).await,
        };
        match result {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                self.healer.container_missing(&record).await?;
                return Err(FleetError::ContainerMissing(*id));
            }
            Err(err) => return Err(err.into()),
        }

        match self
            .store
            .update_status(id, transition.required(), transition.target(), Utc::now())
            .await
        {
            Ok(updated) => {
                info!(status = %updated.status, "server {}", transition.name());
                Ok(updated)
            }
            // A sweep recorded the same live state first.
            Err(StoreError::StatusConflict { actual, .. }) if actual == transition.target() => {
                debug!(status = %actual, "server already {}", transition.name());
                self.store
                    .get_by_id(id)
                    .await?
                    .ok_or(FleetError::RecordNotFound(*id))
            }
            Err(StoreError::StatusConflict { actual, .. }) => Err(FleetError::InvalidStateTransition {
                record_id: *id,
                operation: transition.name(),
                status: actual,
            }),
            Err(err) => Err(err.into()),
        }
    }
}
