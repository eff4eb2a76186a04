//! Agent selection strategies
//!
//! Every strategy reduces to a score where higher wins. Candidates are
//! visited in pool order and only a strictly better score replaces the
//! current pick, so ties go to the earliest registered agent.

use crate::types::{PoolAgent, Task};
use serde::{Deserialize, Serialize};

/// How the load balancer picks among capable agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Fewest completed tasks
    RoundRobin,
    /// Lowest load relative to capacity
    LeastLoaded,
    /// Highest agent priority
    PriorityBased,
    /// Best capability overlap with the task
    CapabilityWeighted,
    /// Weighted blend of load, priority, reliability, speed and capability fit
    Dynamic,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::Dynamic
    }
}

/// `2 × matched + 0.5 × extra` capabilities
pub fn capability_score(agent: &PoolAgent, task: &Task) -> f64 {
    let matched = task
        .required_capabilities
        .iter()
        .filter(|cap| agent.capabilities.contains(*cap))
        .count();
    let extra = agent.capabilities.len().saturating_sub(matched);
    2.0 * matched as f64 + 0.5 * extra as f64
}

pub fn dynamic_score(agent: &PoolAgent, task: &Task) -> f64 {
    let speed = if agent.average_task_duration_ms > 0.0 {
        1.0 / (agent.average_task_duration_ms / 1000.0)
    } else {
        1.0
    };

    0.30 * (1.0 - agent.load_ratio())
        + 0.20 * (agent.priority as f64 / 10.0)
        + 0.20 * (1.0 - agent.error_rate)
        + 0.15 * speed
        + 0.15 * (capability_score(agent, task) / 10.0)
}

fn score(strategy: Strategy, agent: &PoolAgent, task: &Task) -> f64 {
    match strategy {
        Strategy::RoundRobin => -(agent.total_tasks_completed as f64),
        Strategy::LeastLoaded => -agent.load_ratio(),
        Strategy::PriorityBased => agent.priority as f64,
        Strategy::CapabilityWeighted => capability_score(agent, task),
        Strategy::Dynamic => dynamic_score(agent, task),
    }
}

/// Pick the best candidate for `task`, or `None` when there are none
pub fn select<'a, I>(strategy: Strategy, candidates: I, task: &Task) -> Option<&'a PoolAgent>
where
    I: IntoIterator<Item = &'a PoolAgent>,
{
    let mut best: Option<(&PoolAgent, f64)> = None;
    for agent in candidates {
        let value = score(strategy, agent, task);
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((agent, value)),
        }
    }
    best.map(|(agent, _)| agent)
}
