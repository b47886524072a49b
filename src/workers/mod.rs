//! Execution backends and the registry that tracks them.

pub mod capability;
pub mod registry;

pub use capability::{
    MaintenanceWindow, PerformanceStats, ResourceProfile, WorkerCapability, WorkerKind,
};
pub use registry::{Heartbeat, TaskOutcome, WorkerRegistry};
