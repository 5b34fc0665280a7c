//! berth fleet engine
//!
//! The allocation and lifecycle core:
//! - [`Provisioner`]: initiate, confirm and expire allocations
//! - [`Reconciler`]: converge records to runtime ground truth
//! - [`LifecycleController`]: owner-scoped start, stop and remove
//!
//! Components take their store and runtime handles at construction;
//! [`FleetEngine::builder`] wires them together.

pub mod builder;
pub mod config;
pub mod error;
pub mod healing;
pub mod lifecycle;
pub mod provisioner;
pub mod reconciler;

pub use builder::{FleetEngine, FleetEngineBuilder};
pub use config::{ProvisioningConfig, ReconcilerConfig};
pub use error::{FleetError, Result};
pub use healing::DriftHealer;
pub use lifecycle::LifecycleController;
pub use provisioner::{ConfirmOutcome, Provisioner};
pub use reconciler::{ReconcileFailure, ReconcileReport, Reconciler, RecordOutcome};
