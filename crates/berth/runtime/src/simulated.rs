//! In-process runtime for development and testing.
//!
//! Behaves like a single container host: names and host ports are unique,
//! create starts the container, remove forgets it. Like Docker, every
//! operation taking a `RuntimeId` also accepts the container name. Faults can be injected
//! per operation and containers can be mutated "out of band" to simulate
//! crashes and manual removal.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use berth_types::RuntimeId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::RuntimeClient;
use crate::error::{Result, RuntimeError};
use crate::spec::{ContainerInfo, ContainerSpec, LiveStatus};

/// Runtime operations, for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Inspect,
    Start,
    Stop,
    Remove,
    List,
}

#[derive(Debug, Clone)]
struct SimContainer {
    name: String,
    host_port: u16,
    spec: Option<ContainerSpec>,
    status: LiveStatus,
}

#[derive(Debug, Default)]
struct SimState {
    containers: HashMap<RuntimeId, SimContainer>,
    faults: HashMap<Operation, VecDeque<RuntimeError>>,
    next_id: u64,
}

impl SimState {
    fn take_fault(&mut self, op: Operation) -> Option<RuntimeError> {
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    /// Key of the container addressed by `reference`, by id or by name.
    fn resolve(&self, reference: &RuntimeId) -> Option<RuntimeId> {
        if self.containers.contains_key(reference) {
            return Some(reference.clone());
        }
        self.containers
            .iter()
            .find(|(_, c)| c.name == reference.as_str())
            .map(|(id, _)| id.clone())
    }

    fn allocate_id(&mut self) -> RuntimeId {
        self.next_id += 1;
        RuntimeId::new(format!("sim{:061x}", self.next_id))
    }
}

/// Simulated single-host container runtime
#[derive(Debug, Default)]
pub struct SimulatedRuntime {
    state: Mutex<SimState>,
    create_delay: Mutex<Option<Duration>>,
    calls: [AtomicUsize; 6],
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `op` with `error`. Faults queue up per operation.
    pub async fn fail_next(&self, op: Operation, error: RuntimeError) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Make every subsequent create take `delay` before answering.
    pub async fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock().await = delay;
    }

    /// Delete a container behind the engine's back.
    pub async fn remove_out_of_band(&self, id: &RuntimeId) -> bool {
        self.state.lock().await.containers.remove(id).is_some()
    }

    /// Change a container's live state behind the engine's back.
    pub async fn set_status(&self, id: &RuntimeId, status: LiveStatus) -> bool {
        match self.state.lock().await.containers.get_mut(id) {
            Some(container) => {
                container.status = status;
                true
            }
            None => false,
        }
    }

    /// Plant a container the engine never created.
    pub async fn insert_unmanaged(&self, name: &str, host_port: u16) -> RuntimeId {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.containers.insert(
            id.clone(),
            SimContainer {
                name: name.to_string(),
                host_port,
                spec: None,
                status: LiveStatus::Running,
            },
        );
        id
    }

    /// Spec a container was created with, if it was created through `create`.
    pub async fn spec_of(&self, id: &RuntimeId) -> Option<ContainerSpec> {
        self.state
            .lock()
            .await
            .containers
            .get(id)
            .and_then(|c| c.spec.clone())
    }

    pub async fn status_of(&self, id: &RuntimeId) -> Option<LiveStatus> {
        self.state.lock().await.containers.get(id).map(|c| c.status)
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: Operation) -> usize {
        self.calls[Self::slot(op)].load(Ordering::SeqCst)
    }

    fn record_call(&self, op: Operation) {
        self.calls[Self::slot(op)].fetch_add(1, Ordering::SeqCst);
    }

    fn slot(op: Operation) -> usize {
        match op {
            Operation::Create => 0,
            Operation::Inspect => 1,
            Operation::Start => 2,
            Operation::Stop => 3,
            Operation::Remove => 4,
            Operation::List => 5,
        }
    }

    async fn transition(&self, op: Operation, id: &RuntimeId, to: LiveStatus) -> Result<()> {
        self.record_call(op);
        let mut state = self.state.lock().await;
        if let Some(fault) = state.take_fault(op) {
            return Err(fault);
        }
        let key = state
            .resolve(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if let Some(container) = state.containers.get_mut(&key) {
            container.status = to;
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for SimulatedRuntime {
    fn backend(&self) -> &'static str {
        "simulated"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeId> {
        self.record_call(Operation::Create);
        let delay = *self.create_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(fault) = state.take_fault(Operation::Create) {
            return Err(fault);
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Rejected(format!(
                "container name {} is already in use",
                spec.name
            )));
        }
        if state.containers.values().any(|c| c.host_port == spec.host_port) {
            return Err(RuntimeError::Rejected(format!(
                "host port {} is already allocated",
                spec.host_port
            )));
        }

        let id = state.allocate_id();
        state.containers.insert(
            id.clone(),
            SimContainer {
                name: spec.name.clone(),
                host_port: spec.host_port,
                spec: Some(spec.clone()),
                status: LiveStatus::Running,
            },
        );
        debug!(name = %spec.name, runtime_id = %id.short(), "simulated container created");
        Ok(id)
    }

    async fn inspect(&self, id: &RuntimeId) -> Result<ContainerInfo> {
        self.record_call(Operation::Inspect);
        let mut state = self.state.lock().await;
        if let Some(fault) = state.take_fault(Operation::Inspect) {
            return Err(fault);
        }
        state
            .resolve(id)
            .and_then(|key| {
                state.containers.get(&key).map(|c| ContainerInfo {
                    name: c.name.clone(),
                    status: c.status,
                    runtime_id: key,
                })
            })
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn start(&self, id: &RuntimeId) -> Result<()> {
        self.transition(Operation::Start, id, LiveStatus::Running)
            .await
    }

    async fn stop(&self, id: &RuntimeId) -> Result<()> {
        self.transition(Operation::Stop, id, LiveStatus::Exited).await
    }

    async fn remove(&self, id: &RuntimeId) -> Result<()> {
        self.record_call(Operation::Remove);
        let mut state = self.state.lock().await;
        if let Some(fault) = state.take_fault(Operation::Remove) {
            return Err(fault);
        }
        let key = state
            .resolve(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.containers.remove(&key);
        Ok(())
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
        self.record_call(Operation::List);
        let mut state = self.state.lock().await;
        if let Some(fault) = state.take_fault(Operation::List) {
            return Err(fault);
        }
        let mut containers: Vec<ContainerInfo> = state
            .containers
            .iter()
            .filter(|(_, c)| c.name.starts_with(name_prefix))
            .map(|(id, c)| ContainerInfo {
                runtime_id: id.clone(),
                name: c.name.clone(),
                status: c.status,
            })
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::RuntimeTemplate;
    use berth_types::{Identity, MemoryLimit};

    fn spec(name: &str, port: u16) -> ContainerSpec {
        RuntimeTemplate::default()
            .container_spec(&Identity::new(name, port), MemoryLimit::parse("2g").unwrap())
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let runtime = SimulatedRuntime::new();
        let id = runtime.create(&spec("srv_000001", 25566)).await.unwrap();
        assert_eq!(runtime.inspect(&id).await.unwrap().status, LiveStatus::Running);

        runtime.stop(&id).await.unwrap();
        assert_eq!(runtime.inspect(&id).await.unwrap().status, LiveStatus::Exited);

        runtime.start(&id).await.unwrap();
        assert_eq!(runtime.status_of(&id).await, Some(LiveStatus::Running));

        runtime.remove(&id).await.unwrap();
        assert!(runtime.inspect(&id).await.unwrap_err().is_not_found());
        assert_eq!(runtime.calls(Operation::Create), 1);
    }

    #[tokio::test]
    async fn test_names_and_ports_are_exclusive() {
        let runtime = SimulatedRuntime::new();
        runtime.create(&spec("srv_000001", 25566)).await.unwrap();
        assert!(matches!(
            runtime.create(&spec("srv_000001", 25567)).await,
            Err(RuntimeError::Rejected(_))
        ));
        assert!(matches!(
            runtime.create(&spec("srv_000002", 25566)).await,
            Err(RuntimeError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let runtime = SimulatedRuntime::new();
        runtime
            .fail_next(Operation::Create, RuntimeError::Unavailable("daemon down".into()))
            .await;
        assert!(runtime
            .create(&spec("srv_000001", 25566))
            .await
            .unwrap_err()
            .is_transient());
        assert!(runtime.create(&spec("srv_000001", 25566)).await.is_ok());
        assert_eq!(runtime.calls(Operation::Create), 2);
    }

    #[tokio::test]
    async fn test_out_of_band_mutation() {
        let runtime = SimulatedRuntime::new();
        let id = runtime.create(&spec("srv_000001", 25566)).await.unwrap();
        assert!(runtime.set_status(&id, LiveStatus::Dead).await);
        assert_eq!(runtime.inspect(&id).await.unwrap().status, LiveStatus::Dead);
        assert!(runtime.remove_out_of_band(&id).await);
        assert!(runtime.stop(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_container_name_addresses_container() {
        let runtime = SimulatedRuntime::new();
        let id = runtime.create(&spec("srv_000001", 25566)).await.unwrap();
        let by_name = RuntimeId::new("srv_000001");

        assert_eq!(runtime.inspect(&by_name).await.unwrap().runtime_id, id);
        runtime.remove(&by_name).await.unwrap();
        assert_eq!(runtime.container_count().await, 0);
        assert!(runtime.remove(&by_name).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let runtime = SimulatedRuntime::new();
        runtime.create(&spec("srv_000002", 25567)).await.unwrap();
        runtime.create(&spec("srv_000001", 25566)).await.unwrap();
        runtime.insert_unmanaged("postgres", 5432).await;

        let listed = runtime.list("srv_").await.unwrap();
        let names: Vec<_> = listed.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["srv_000001", "srv_000002"]);
    }
}
