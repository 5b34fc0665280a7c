//! Builder for FleetEngine
//!
//! Wires the provisioner, reconciler and lifecycle controller around one
//! shared store and runtime handle.

use std::sync::Arc;

use berth_runtime::{RuntimeClient, RuntimeTemplate};
use berth_store::FleetStore;
use berth_types::PlanTable;

use crate::config::{ProvisioningConfig, ReconcilerConfig};
use crate::error::{FleetError, Result};
use crate::healing::DriftHealer;
use crate::lifecycle::LifecycleController;
use crate::provisioner::Provisioner;
use crate::reconciler::Reconciler;

/// The assembled allocation and lifecycle engine
#[derive(Clone)]
pub struct FleetEngine {
    pub provisioner: Arc<Provisioner>,
    pub reconciler: Arc<Reconciler>,
    pub lifecycle: Arc<LifecycleController>,
    store: Arc<dyn FleetStore>,
    runtime: Arc<dyn RuntimeClient>,
}

impl FleetEngine {
    pub fn builder() -> FleetEngineBuilder {
        FleetEngineBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }
}

/// Builder for constructing a FleetEngine with all dependencies
#[derive(Default)]
pub struct FleetEngineBuilder {
    store: Option<Arc<dyn FleetStore>>,
    runtime: Option<Arc<dyn RuntimeClient>>,
    plans: Option<PlanTable>,
    template: Option<RuntimeTemplate>,
    provisioning: Option<ProvisioningConfig>,
    reconciler: Option<ReconcilerConfig>,
}

impl FleetEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fleet store
    pub fn with_store(mut self, store: Arc<dyn FleetStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the container runtime
    pub fn with_runtime(mut self, runtime: Arc<dyn RuntimeClient>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the plan table (defaults to the built-in plans)
    pub fn with_plans(mut self, plans: PlanTable) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn with_template(mut self, template: RuntimeTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_provisioning_config(mut self, config: ProvisioningConfig) -> Self {
        self.provisioning = Some(config);
        self
    }

    pub fn with_reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler = Some(config);
        self
    }

    /// Build the engine. Store and runtime are required.
    pub fn build(self) -> Result<FleetEngine> {
        let store = self
            .store
            .ok_or_else(|| FleetError::Configuration("fleet store is required".into()))?;
        let runtime = self
            .runtime
            .ok_or_else(|| FleetError::Configuration("runtime client is required".into()))?;

        let plans = self.plans.unwrap_or_default();
        if plans.is_empty() {
            return Err(FleetError::Configuration("plan table is empty".into()));
        }

        let healer = DriftHealer::new(store.clone());
        let provisioner = Provisioner::new(
            store.clone(),
            runtime.clone(),
            plans,
            self.template.unwrap_or_default(),
            self.provisioning.unwrap_or_default(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            runtime.clone(),
            healer.clone(),
            self.reconciler.unwrap_or_default(),
        );
        let lifecycle = LifecycleController::new(store.clone(), runtime.clone(), healer);

        Ok(FleetEngine {
            provisioner: Arc::new(provisioner),
            reconciler: Arc::new(reconciler),
            lifecycle: Arc::new(lifecycle),
            store,
            runtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_pool::PoolConfig;
    use berth_runtime::SimulatedRuntime;
    use berth_store::InMemoryFleetStore;

    #[test]
    fn test_missing_dependencies_are_reported() {
        let err = FleetEngine::builder().build().err().unwrap();
        assert!(matches!(err, FleetError::Configuration(_)));

        let store = Arc::new(InMemoryFleetStore::new(PoolConfig::default()).unwrap());
        let err = FleetEngine::builder()
            .with_store(store)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FleetError::Configuration(_)));
    }

    #[test]
    fn test_empty_plan_table_is_rejected() {
        let store = Arc::new(InMemoryFleetStore::new(PoolConfig::default()).unwrap());
        let err = FleetEngine::builder()
            .with_store(store)
            .with_runtime(Arc::new(SimulatedRuntime::new()))
            .with_plans(PlanTable::empty())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FleetError::Configuration(_)));
    }
}
