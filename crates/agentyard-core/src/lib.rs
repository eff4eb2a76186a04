//! Agentyard Core Library
//!
//! Multi-agent coordination runtime, including:
//! - The agent contract and a registry with heartbeat tracking
//! - Coordination sessions with shared state, event history and orchestration
//! - A load-balanced task scheduler with retries, dead-agent recovery and handoff
//! - Optional SQLite-backed persistence
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     agentyard-core                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  coordinator.rs - Facade wiring the components together     │
//! │  agent/         - Agent trait, base agent, registry         │
//! │  coordination/  - Sessions, orchestration, retry/backoff    │
//! │  scheduler/     - Task queue, strategies, agent pool        │
//! │  events/        - Global and per-session event bus          │
//! │  storage/       - SQLite store, records                     │
//! │  jobs.rs        - Periodic and one-shot background jobs     │
//! │  clock.rs       - System and manual clocks                  │
//! │  config.rs      - Configuration                             │
//! │  types/         - Shared type definitions                   │
//! │  error.rs       - Error types                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod jobs;
pub mod scheduler;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use types::*;

// Re-export components
pub use agent::{Agent, AgentRegistry, BaseAgent, TaskExecutor};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use coordination::{Backoff, CoordinationManager};
pub use events::EventBus;
pub use scheduler::{RecoveryProbe, SchedulerHooks, Strategy, TaskScheduler};
pub use storage::{SqliteStateStore, StateStore, Storage};

/// Route test logs through `tracing-subscriber` when `RUST_LOG` is set
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
