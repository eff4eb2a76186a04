//! Event publication and per-session fan-out
//!
//! Every event goes to the global topic. Events that belong to a session are
//! also queued on that session's topic, where a dispatcher task delivers them
//! in order to the session's participants and session subscribers.

mod bus;

pub use bus::{EventBus, DEFAULT_GLOBAL_CAPACITY};
