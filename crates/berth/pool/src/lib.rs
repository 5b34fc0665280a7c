//! berth identity pool
//!
//! Hands out unique (name, port) pairs from a bounded range and takes them
//! back on failure or removal.

pub mod config;
pub mod error;
pub mod pool;

pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use pool::{IdentityPool, PoolUsage, SlotState};
