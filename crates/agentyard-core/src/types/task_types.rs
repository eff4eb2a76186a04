//! Task and task-result types

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Task status state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a capable agent
    Queued,
    /// Handed to exactly one agent
    Assigned,
    /// Finished successfully
    Completed,
    /// Retry budget exhausted
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub task_type: String,
    /// Higher is more urgent
    pub priority: i32,
    pub session_id: String,
    pub required_capabilities: BTreeSet<String>,
    pub estimated_duration_ms: u64,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Task {
    /// Create a queued task with a generated id
    pub fn new(task_type: impl Into<String>, session_id: impl Into<String>) -> Self {
        TaskRequest::new(task_type, session_id).into_task(chrono::Utc::now())
    }

    /// Whether another attempt may be made after a failure
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn estimated_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.estimated_duration_ms)
    }

    /// Whether the task can still finish before its deadline if started at `now`
    pub fn fits_deadline(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.deadline {
            Some(deadline) => i64::try_from(self.estimated_duration_ms)
                .ok()
                .and_then(chrono::Duration::try_milliseconds)
                .and_then(|estimate| now.checked_add_signed(estimate))
                .is_some_and(|finish| finish <= deadline),
            None => true,
        }
    }
}

/// Task submission input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_type: String,
    pub session_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    #[serde(default)]
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            session_id: session_id.into(),
            priority: 0,
            required_capabilities: BTreeSet::new(),
            estimated_duration_ms: 0,
            deadline: None,
            max_attempts: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_estimated_duration(mut self, duration: std::time::Duration) -> Self {
        self.estimated_duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_deadline(mut self, deadline: chrono::DateTime<chrono::Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Build a queued task, defaulting to three attempts
    pub fn into_task(self, now: chrono::DateTime<chrono::Utc>) -> Task {
        self.into_task_with_default_attempts(now, 3)
    }

    pub(crate) fn into_task_with_default_attempts(
        self,
        now: chrono::DateTime<chrono::Utc>,
        default_max_attempts: u32,
    ) -> Task {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: self.task_type,
            priority: self.priority,
            session_id: self.session_id,
            required_capabilities: self.required_capabilities,
            estimated_duration_ms: self.estimated_duration_ms,
            deadline: self.deadline,
            payload: self.payload,
            status: TaskStatus::Queued,
            assigned_agent: None,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts).max(1),
            last_error: None,
            created_at: now,
            assigned_at: None,
            completed_at: None,
        }
    }
}

/// Final outcome of one orchestrated task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builds_queued_task() {
        let task = TaskRequest::new("parse", "s1")
            .with_priority(7)
            .with_capabilities(["rust"])
            .with_max_attempts(0)
            .into_task(chrono::Utc::now());

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, 7);
        assert_eq!(task.attempts, 0);
        // zero attempts would make the task unrunnable
        assert_eq!(task.max_attempts, 1);
        assert!(task.required_capabilities.contains("rust"));
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_deadline_fit_uses_estimate() {
        let now = chrono::Utc::now();
        let task = TaskRequest::new("test", "s1")
            .with_estimated_duration(std::time::Duration::from_secs(60))
            .with_deadline(now + chrono::Duration::seconds(30))
            .into_task(now);
        assert!(!task.fits_deadline(now));

        let relaxed = TaskRequest::new("test", "s1")
            .with_estimated_duration(std::time::Duration::from_secs(10))
            .with_deadline(now + chrono::Duration::seconds(30))
            .into_task(now);
        assert!(relaxed.fits_deadline(now));
    }

    #[test]
    fn test_unrepresentable_estimate_never_fits() {
        let now = chrono::Utc::now();
        let task = TaskRequest::new("test", "s1")
            .with_estimated_duration(std::time::Duration::MAX)
            .with_deadline(now + chrono::Duration::seconds(30))
            .into_task(now);
        assert!(!task.fits_deadline(now));

        let mut huge = task.clone();
        huge.estimated_duration_ms = i64::MAX as u64;
        assert!(!huge.fits_deadline(now));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
    }
}
