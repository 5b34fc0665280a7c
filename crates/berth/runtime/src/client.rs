//! The runtime capability consumed by the engine.

use async_trait::async_trait;
use berth_types::RuntimeId;

use crate::error::Result;
use crate::spec::{ContainerInfo, ContainerSpec};

/// Create / inspect / start / stop / remove containers.
///
/// Calls are blocking I/O against an external daemon. Callers must not hold
/// a store transaction across them.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Backend name, for logs.
    fn backend(&self) -> &'static str;

    /// Create and start a container, returning its runtime identity.
    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeId>;

    /// Live state of a container. `NotFound` when the runtime has no such container.
    async fn inspect(&self, id: &RuntimeId) -> Result<ContainerInfo>;

    async fn start(&self, id: &RuntimeId) -> Result<()>;

    async fn stop(&self, id: &RuntimeId) -> Result<()>;

    async fn remove(&self, id: &RuntimeId) -> Result<()>;

    /// Managed containers whose name starts with `name_prefix`.
    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>>;
}
