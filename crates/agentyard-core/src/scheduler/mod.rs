//! Load-balanced task scheduling over a pool of agents

mod balancer;
mod strategy;

pub use balancer::{RecoveryProbe, SchedulerHooks, TaskScheduler};
pub use strategy::{capability_score, dynamic_score, select, Strategy};

#[cfg(test)]
pub use balancer::MockRecoveryProbe;
