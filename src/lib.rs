//! Task delegator: classifies free-text work, routes it to execution
//! backends over a resilient message bus and tracks it to completion.

pub mod bus;
pub mod classifier;
pub mod config;
pub mod delegation;
pub mod embedding;
pub mod error;
pub mod routing;
pub mod store;
pub mod tracker;
pub mod transport;
pub mod workers;

pub use config::DelegatorConfig;
pub use delegation::{Coordinator, DelegationContext, SubmitOptions, Submission};
pub use error::{Error, Result};
