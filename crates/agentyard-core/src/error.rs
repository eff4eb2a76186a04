//! Error types for Agentyard Core

use thiserror::Error;

/// Main error type for Agentyard operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Agent registration and lifecycle errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Agent already registered: {0}")]
    Duplicate(String),

    #[error("Agent pool at capacity ({max} agents)")]
    CapacityExceeded { max: usize },

    #[error("Invalid agent registration: {0}")]
    Validation(String),

    #[error("Agent already running a task: {0}")]
    AlreadyRunning(String),

    #[error("Agent is paused: {0}")]
    Paused(String),

    #[error("Handoff target unavailable: {0}")]
    HandoffTargetUnavailable(String),

    #[error("Agent handler failed: {0}")]
    Handler(String),
}

/// Task execution and scheduling errors
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task not assigned: {0}")]
    NotAssigned(String),

    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: String, timeout_ms: u64 },

    #[error("Task {task_id} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),
}

/// Coordination session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Connection pool error: {0}")]
    Pool(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config file {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

impl Error {
    /// Whether a failed task attempt with this error may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Task(TaskError::RetryExhausted { .. }) => false,
            Error::Task(_) => true,
            Error::Agent(AgentError::AlreadyRunning(_)) | Error::Agent(AgentError::Paused(_)) => {
                true
            }
            Error::Agent(AgentError::Handler(_)) => true,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this error is a per-attempt timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Task(TaskError::Timeout { .. }))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::Storage(StorageError::Pool(err.to_string()))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
