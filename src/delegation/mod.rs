//! Task model, session context and the coordinator that drives tasks
//! from submission to a terminal status.

pub mod context;
pub mod coordinator;
pub mod task;

pub use context::DelegationContext;
pub use coordinator::{Coordinator, SubmitOptions, Submission};
pub use task::{
    Priority, ResourceLevel, ResourceRequirements, Task, TaskCategory, TaskStatus, TaskType,
};
