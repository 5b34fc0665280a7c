//! berth runtime capability
//!
//! The container runtime is consumed, not implemented: this crate defines
//! the interface the engine drives, a simulated backend for development and
//! tests, and (behind the `docker` feature) a Docker engine adapter.

pub mod client;
#[cfg(feature = "docker")]
pub mod docker;
pub mod error;
pub mod simulated;
pub mod spec;

pub use client::RuntimeClient;
#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use simulated::{Operation, SimulatedRuntime};
pub use spec::{ContainerInfo, ContainerSpec, LiveStatus, RuntimeTemplate, MANAGED_LABEL};
