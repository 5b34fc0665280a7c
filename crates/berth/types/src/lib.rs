//! berth core types
//!
//! Shared vocabulary for the allocation and lifecycle engine:
//! identifiers, network identities, fleet records, pending allocations,
//! the plan catalogue and payment events.

pub mod allocation;
pub mod event;
pub mod identity;
pub mod ids;
pub mod plan;
pub mod record;

pub use allocation::{AllocationState, PendingAllocation};
pub use event::{PaymentEvent, PURCHASE_CONFIRMED};
pub use identity::Identity;
pub use ids::{OwnerId, RecordId, RuntimeId, SessionId};
pub use plan::{MemoryLimit, PlanError, PlanId, PlanSpec, PlanTable};
pub use record::{FleetRecord, FleetStatus};
