//! Coordination sessions, orchestration and retry policy

mod manager;
mod retry;

pub use manager::{CoordinationManager, DEFAULT_SESSION_ID, ORCHESTRATION_RESULTS_KEY};
pub use retry::{retry_with_backoff, with_timeout, Attempted, Backoff};
