//! Coordination session, handoff and orchestration types

use super::{Event, Task};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Shared state of a coordination session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationContext {
    pub session_id: String,
    pub initiator_id: String,
    /// Ordered and free of duplicates; always contains the initiator
    pub participants: Vec<String>,
    pub shared_state: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub events: VecDeque<Event>,
    pub ttl_ms: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub first_event_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CoordinationContext {
    pub fn new(
        session_id: impl Into<String>,
        initiator_id: impl Into<String>,
        participants: Vec<String>,
        shared_state: HashMap<String, serde_json::Value>,
        ttl: Duration,
    ) -> Self {
        let initiator_id = initiator_id.into();
        let mut context = Self {
            session_id: session_id.into(),
            initiator_id: initiator_id.clone(),
            participants: Vec::with_capacity(participants.len() + 1),
            shared_state,
            events: VecDeque::new(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            created_at: chrono::Utc::now(),
            first_event_at: None,
        };
        context.add_participant(&initiator_id);
        for participant in &participants {
            context.add_participant(participant);
        }
        context
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn is_participant(&self, agent_id: &str) -> bool {
        self.participants.iter().any(|p| p == agent_id)
    }

    /// Returns false when the agent was already present
    pub fn add_participant(&mut self, agent_id: &str) -> bool {
        if self.is_participant(agent_id) {
            return false;
        }
        self.participants.push(agent_id.to_string());
        true
    }

    /// Returns false when the agent was not a participant.
    ///
    /// If the initiator leaves, the earliest remaining participant becomes
    /// the initiator.
    pub fn remove_participant(&mut self, agent_id: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != agent_id);
        if self.participants.len() == before {
            return false;
        }
        if self.initiator_id == agent_id {
            if let Some(next) = self.participants.first() {
                self.initiator_id = next.clone();
            }
        }
        true
    }

    /// Append to the bounded event buffer, dropping the oldest past `capacity`
    pub fn record_event(&mut self, event: Event, capacity: usize) {
        if self.first_event_at.is_none() {
            self.first_event_at = Some(event.timestamp);
        }
        self.events.push_back(event);
        while self.events.len() > capacity.max(1) {
            self.events.pop_front();
        }
    }

    /// Time left before the session expires. The clock starts at the first
    /// recorded event, so a session without events keeps its full ttl.
    pub fn remaining_ttl(&self, now: chrono::DateTime<chrono::Utc>) -> Duration {
        let Some(first) = self.first_event_at else {
            return self.ttl();
        };
        let elapsed = (now - first).to_std().unwrap_or(Duration::ZERO);
        self.ttl().saturating_sub(elapsed)
    }

    /// Whether the ttl has elapsed since the first recorded event
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(first) = self.first_event_at else {
            return false;
        };
        let ttl = chrono::Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX));
        now - first > ttl
    }

    /// Participants that should receive an event sent by `sender`
    pub fn recipients(&self, sender: &str) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.as_str() != sender)
            .cloned()
            .collect()
    }
}

/// Request to move a session from one agent to another
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffContext {
    pub session_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub context: serde_json::Value,
    pub priority: i32,
    pub estimated_duration_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HandoffContext {
    pub fn new(
        session_id: impl Into<String>,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            reason: reason.into(),
            context: serde_json::Value::Null,
            priority: 0,
            estimated_duration_ms: 0,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// One task of an orchestrated workflow, bound to the agent that runs it
#[derive(Debug, Clone)]
pub struct OrchestrationStep {
    pub agent_id: String,
    pub task: Task,
}

impl OrchestrationStep {
    pub fn new(agent_id: impl Into<String>, task: Task) -> Self {
        Self {
            agent_id: agent_id.into(),
            task,
        }
    }
}

/// Execution options for [`crate::coordination::CoordinationManager::orchestrate`]
#[derive(Debug, Clone)]
pub struct OrchestrationOptions {
    /// Run every step concurrently instead of stopping at the first failure
    pub parallel: bool,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Total attempts per step
    pub retry_attempts: u32,
}

impl Default for OrchestrationOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            timeout: Duration::from_millis(300_000),
            retry_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    fn context(participants: &[&str]) -> CoordinationContext {
        CoordinationContext::new(
            "s1",
            "lead",
            participants.iter().map(|p| p.to_string()).collect(),
            HashMap::new(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_remaining_ttl_counts_from_first_event() {
        let mut ctx = context(&[]);
        let start = chrono::Utc::now();
        assert_eq!(ctx.remaining_ttl(start), Duration::from_secs(60));

        let mut event = Event::system(EventKind::StateUpdated, serde_json::json!({}));
        event.timestamp = start;
        ctx.record_event(event, 10);

        let later = start + chrono::Duration::seconds(45);
        assert_eq!(ctx.remaining_ttl(later), Duration::from_secs(15));
        assert_eq!(
            ctx.remaining_ttl(start + chrono::Duration::seconds(90)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_initiator_is_first_participant() {
        let ctx = context(&["a", "lead", "b", "a"]);
        assert_eq!(ctx.participants, vec!["lead", "a", "b"]);
    }

    #[test]
    fn test_initiator_leaving_promotes_next() {
        let mut ctx = context(&["a", "b"]);
        assert!(ctx.remove_participant("lead"));
        assert_eq!(ctx.initiator_id, "a");
        assert!(ctx.is_participant(&ctx.initiator_id));
        assert!(!ctx.remove_participant("lead"));
    }

    #[test]
    fn test_event_buffer_is_bounded() {
        let mut ctx = context(&[]);
        for i in 0..5 {
            ctx.record_event(
                Event::system(EventKind::StateUpdated, serde_json::json!({ "i": i })),
                3,
            );
        }
        assert_eq!(ctx.events.len(), 3);
        assert_eq!(ctx.events[0].payload["i"], 2);
        assert!(ctx.first_event_at.is_some());
    }

    #[test]
    fn test_expiry_counts_from_first_event() {
        let mut ctx = context(&[]);
        let now = chrono::Utc::now();
        assert!(!ctx.is_expired(now + chrono::Duration::hours(1)));

        ctx.record_event(Event::system(EventKind::SessionCreated, serde_json::Value::Null), 10);
        let first = ctx.first_event_at.unwrap();
        assert!(!ctx.is_expired(first + chrono::Duration::seconds(59)));
        assert!(ctx.is_expired(first + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_recipients_exclude_sender() {
        let ctx = context(&["a", "b"]);
        assert_eq!(ctx.recipients("a"), vec!["lead", "b"]);
    }
}
