//! Shared registries: readiness, compatibility history, autotune profiles.
//!
//! These are owned by the engine façade and shared by reference. None of them
//! ever calls back into the engine — updates flow one way, from the lifecycle
//! manager into the registries, and out through observer events.

pub mod autotune;
pub mod compatibility;
pub mod readiness;

pub use autotune::{AutotuneMetrics, AutotuneRecord, AutotuneRegistry};
pub use compatibility::{
    CompatFilter, CompatOutcome, CompatSummary, CompatibilityRegistry, CompatibilityRow,
};
pub use readiness::{ReadinessRecord, ReadinessState, ReadinessTracker};
