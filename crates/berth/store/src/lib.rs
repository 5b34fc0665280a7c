//! berth fleet store
//!
//! Durable home of fleet records and pending allocations. Identity
//! reservation, assignment and release happen inside the same transaction
//! as the row they belong to.
//!
//! Two backends are provided:
//! - [`InMemoryFleetStore`] for development and tests
//! - `PostgresFleetStore` behind the `postgres` feature

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod state;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryFleetStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresFleetStore;
pub use traits::{ClaimOutcome, FleetStore, NewPending, RemovalOutcome, TransactionPolicy};
