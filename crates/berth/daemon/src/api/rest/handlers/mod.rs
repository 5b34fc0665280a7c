//! API request handlers

mod allocations;
mod caller;
mod fleet;
mod health;

pub use allocations::*;
pub use caller::{Caller, OWNER_HEADER};
pub use fleet::*;
pub use health::*;
