//! berth daemon library
//!
//! This module provides the components of the `berthd` service:
//! - REST API for purchases, payment events and fleet management
//! - Scheduler for periodic reconciliation and allocation expiry
//! - Server lifecycle management

pub mod api;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError};
pub use scheduler::Scheduler;
pub use server::Server;
