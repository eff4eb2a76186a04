//! Agent contract and registry
//!
//! This module handles:
//! - The behavioral interface every agent implements
//! - The per-agent runtime state machine
//! - Registration, heartbeat tracking and stale-agent cleanup

mod contract;
mod registry;

pub use contract::{Agent, BaseAgent, TaskExecutor};
pub use registry::AgentRegistry;

#[cfg(test)]
pub use contract::MockTaskExecutor;

#[cfg(test)]
pub(crate) use contract::testing;
