//! Background sweeps

mod reconciler;

pub use reconciler::Scheduler;
