//! Core type definitions for Agentyard
//!
//! This module contains the shared records used across the crate: agent
//! identity and pool records, tasks, coordination sessions and events.

mod agent_types;
mod event_types;
mod session_types;
mod task_types;

pub use agent_types::*;
pub use event_types::*;
pub use session_types::*;
pub use task_types::*;

use serde::{Deserialize, Serialize};

/// Point-in-time view of the load balancer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerMetrics {
    pub total_agents: usize,
    pub active_agents: usize,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Mean over agents that completed work, in milliseconds
    pub average_task_duration_ms: f64,
    /// Total load over total capacity of live agents
    pub system_load: f64,
    pub dead_agent_count: usize,
    pub handoff_count: u64,
}
