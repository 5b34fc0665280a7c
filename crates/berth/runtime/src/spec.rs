//! What we ask the runtime to run, and what it tells us back.

use std::collections::BTreeMap;

use berth_types::{FleetStatus, Identity, MemoryLimit, RuntimeId};
use serde::{Deserialize, Serialize};

/// Label marking containers created by berth.
pub const MANAGED_LABEL: &str = "berth.managed";

/// Deployment-wide container settings shared by every game server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeTemplate {
    /// Image every game server runs.
    pub image: String,

    /// Port the game server listens on inside the container.
    pub container_port: u16,

    /// Environment passed to every container.
    pub env: BTreeMap<String, String>,

    /// Extra labels; the managed label is always added.
    pub labels: BTreeMap<String, String>,
}

impl Default for RuntimeTemplate {
    fn default() -> Self {
        Self {
            image: "itzg/minecraft-server".to_string(),
            container_port: 25565,
            env: BTreeMap::from([("EULA".to_string(), "TRUE".to_string())]),
            labels: BTreeMap::new(),
        }
    }
}

impl RuntimeTemplate {
    pub fn container_spec(&self, identity: &Identity, memory_limit: MemoryLimit) -> ContainerSpec {
        let mut labels = self.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        ContainerSpec {
            name: identity.name.clone(),
            image: self.image.clone(),
            host_port: identity.port,
            container_port: self.container_port,
            env: self.env.clone(),
            memory_limit,
            labels,
        }
    }
}

/// A fully-resolved container creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: BTreeMap<String, String>,
    pub memory_limit: MemoryLimit,
    pub labels: BTreeMap<String, String>,
}

/// Live state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

impl LiveStatus {
    /// The fleet status a record should carry for this live state.
    pub fn as_fleet_status(&self) -> FleetStatus {
        match self {
            LiveStatus::Running | LiveStatus::Restarting => FleetStatus::Running,
            LiveStatus::Created | LiveStatus::Paused | LiveStatus::Exited | LiveStatus::Dead => {
                FleetStatus::Stopped
            }
        }
    }
}

/// A container as seen by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub runtime_id: RuntimeId,
    pub name: String,
    pub status: LiveStatus,
}
