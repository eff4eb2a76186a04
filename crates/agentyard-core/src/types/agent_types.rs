//! Agent identity, runtime state and pool record types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Kind of work an agent specializes in
///
/// The well-known kinds map to the platform's built-in agents. Any other
/// string is carried through as [`AgentType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentType {
    Parse,
    Test,
    Scm,
    Verification,
    Analysis,
    Other(String),
}

impl AgentType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Parse => "parse",
            Self::Test => "test",
            Self::Scm => "scm",
            Self::Verification => "verification",
            Self::Analysis => "analysis",
            Self::Other(name) => name.as_str(),
        }
    }
}

impl From<&str> for AgentType {
    fn from(s: &str) -> Self {
        match s {
            "parse" => Self::Parse,
            "test" => Self::Test,
            "scm" => Self::Scm,
            "verification" => Self::Verification,
            "analysis" => Self::Analysis,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for AgentType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AgentType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from(raw))
    }
}

/// Execution state of a single agent instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    /// Ready to accept a task
    Idle,
    /// Executing a task
    Running,
    /// Suspended by the coordinator
    Paused,
    /// Last task ended in an error
    Failed,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Health report returned by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub agent_id: String,
    pub state: RuntimeState,
    pub current_task: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl AgentHealth {
    pub fn is_healthy(&self) -> bool {
        self.state != RuntimeState::Failed
    }
}

/// Liveness of a registry entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Active,
    Inactive,
}

/// Snapshot of an agent registered with the [`crate::agent::AgentRegistry`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredAgent {
    pub id: String,
    pub agent_type: AgentType,
    pub capabilities: BTreeSet<String>,
    pub name: String,
    pub version: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: RegistrationStatus,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub inactive_since: Option<chrono::DateTime<chrono::Utc>>,
}

/// Scheduling status of an agent in the load balancer pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No assigned work
    Idle,
    /// Some work assigned, capacity left
    Active,
    /// At capacity
    Busy,
    /// Excluded from scheduling until resumed
    Paused,
    /// Missed its heartbeat deadline
    Dead,
}

impl AgentStatus {
    /// Whether the agent can be offered new work
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Idle | Self::Active)
    }
}

/// Input for adding an agent to the scheduler pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAgentSpec {
    pub id: String,
    pub agent_type: AgentType,
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "PoolAgentSpec::default_max_load")]
    pub max_load: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PoolAgentSpec {
    pub fn new(id: impl Into<String>, agent_type: impl Into<AgentType>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
            priority: 0,
            max_load: Self::default_max_load(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_load(mut self, max_load: u32) -> Self {
        self.max_load = max_load;
        self
    }

    fn default_max_load() -> u32 {
        5
    }
}

/// Agent record tracked by the load balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAgent {
    pub id: String,
    pub agent_type: AgentType,
    pub capabilities: BTreeSet<String>,
    pub priority: i32,
    pub load: u32,
    pub max_load: u32,
    pub status: AgentStatus,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub current_sessions: BTreeSet<String>,
    pub total_tasks_completed: u64,
    /// Running mean in milliseconds
    pub average_task_duration_ms: f64,
    pub error_rate: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PoolAgent {
    pub fn from_spec(spec: PoolAgentSpec, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id: spec.id,
            agent_type: spec.agent_type,
            capabilities: spec.capabilities,
            priority: spec.priority,
            load: 0,
            max_load: spec.max_load,
            status: AgentStatus::Idle,
            last_heartbeat: now,
            current_sessions: BTreeSet::new(),
            total_tasks_completed: 0,
            average_task_duration_ms: 0.0,
            error_rate: 0.0,
            metadata: spec.metadata,
        }
    }

    /// Fraction of capacity in use
    pub fn load_ratio(&self) -> f64 {
        if self.max_load == 0 {
            1.0
        } else {
            self.load as f64 / self.max_load as f64
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.load < self.max_load
    }

    /// Whether every required capability is advertised
    pub fn supports_all(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Recompute idle/active/busy from the current load.
    ///
    /// Dead and paused agents keep their status.
    pub fn refresh_status(&mut self) {
        if matches!(self.status, AgentStatus::Dead | AgentStatus::Paused) {
            return;
        }
        self.status = if self.load >= self.max_load {
            AgentStatus::Busy
        } else if self.load == 0 {
            AgentStatus::Idle
        } else {
            AgentStatus::Active
        };
    }
}
