//! Coordination event types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source id used for events the coordinator generates itself
pub const COORDINATOR_ID: &str = "coordinator";

/// Type of a coordination event
///
/// Serialized as its wire name (`"task:assigned"`, `"session:created"`, ...).
/// Names outside the known set round-trip through [`EventKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentRegistered,
    AgentUnregistered,
    AgentDead,
    AgentRecovered,
    AgentRecoveryProbe,
    StaleAgentsDetected,
    TaskSubmitted,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetry,
    HandoffInitiated,
    SessionCreated,
    SessionJoined,
    SessionLeft,
    SessionEnded,
    StateUpdated,
    Error,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentRegistered => "agent:registered",
            Self::AgentUnregistered => "agent:unregistered",
            Self::AgentDead => "agent:dead",
            Self::AgentRecovered => "agent:recovered",
            Self::AgentRecoveryProbe => "agent:recovery-probe",
            Self::StaleAgentsDetected => "stale-agents-detected",
            Self::TaskSubmitted => "task:submitted",
            Self::TaskAssigned => "task:assigned",
            Self::TaskStarted => "task:started",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::TaskRetry => "task:retry",
            Self::HandoffInitiated => "handoff:initiated",
            Self::SessionCreated => "session:created",
            Self::SessionJoined => "session:joined",
            Self::SessionLeft => "session:left",
            Self::SessionEnded => "session:ended",
            Self::StateUpdated => "state:updated",
            Self::Error => "error",
            Self::Custom(name) => name.as_str(),
        }
    }

    /// Whether this kind concerns a session's lifecycle
    pub fn is_session_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::SessionCreated | Self::SessionJoined | Self::SessionLeft | Self::SessionEnded
        )
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "agent:registered" => Self::AgentRegistered,
            "agent:unregistered" => Self::AgentUnregistered,
            "agent:dead" => Self::AgentDead,
            "agent:recovered" => Self::AgentRecovered,
            "agent:recovery-probe" => Self::AgentRecoveryProbe,
            "stale-agents-detected" => Self::StaleAgentsDetected,
            "task:submitted" => Self::TaskSubmitted,
            "task:assigned" => Self::TaskAssigned,
            "task:started" => Self::TaskStarted,
            "task:completed" => Self::TaskCompleted,
            "task:failed" => Self::TaskFailed,
            "task:retry" => Self::TaskRetry,
            "handoff:initiated" => Self::HandoffInitiated,
            "session:created" => Self::SessionCreated,
            "session:joined" => Self::SessionJoined,
            "session:left" => Self::SessionLeft,
            "session:ended" => Self::SessionEnded,
            "state:updated" => Self::StateUpdated,
            "error" => Self::Error,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from(raw.as_str()))
    }
}

/// An immutable coordination event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Source agent, or [`COORDINATOR_ID`]
    pub agent_id: String,
    pub session_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, agent_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            agent_id: agent_id.into(),
            session_id: None,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    /// Event raised by the coordinator itself
    pub fn system(kind: EventKind, payload: serde_json::Value) -> Self {
        Self::new(kind, COORDINATOR_ID, payload)
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_system(&self) -> bool {
        self.agent_id == COORDINATOR_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        for kind in [
            EventKind::TaskRetry,
            EventKind::StaleAgentsDetected,
            EventKind::HandoffInitiated,
            EventKind::StateUpdated,
        ] {
            assert_eq!(EventKind::from(kind.as_str()), kind);
        }
        assert_eq!(
            EventKind::from("index:rebuilt"),
            EventKind::Custom("index:rebuilt".to_string())
        );
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = Event::system(EventKind::SessionCreated, serde_json::json!({"n": 1}))
            .in_session("s1");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "session:created");
        assert_eq!(value["agentId"], COORDINATOR_ID);
        assert_eq!(value["sessionId"], "s1");
        assert!(event.is_system());
    }
}
