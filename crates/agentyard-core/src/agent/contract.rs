//! Agent behavioral contract
//!
//! [`Agent`] is the interface the coordinator drives. [`BaseAgent`] supplies
//! the per-agent state machine on top of a [`TaskExecutor`] so agent
//! authors only write the work itself:
//!
//! ```text
//! idle ──execute──► running ──ok──► idle
//!                      │ └──err──► failed ──execute──► running
//!                      ▼
//!                   paused ──resume──► (previous state)
//! ```

use crate::error::{AgentError, Error, Result};
use crate::types::{AgentHealth, AgentType, Event, EventKind, RuntimeState, Task};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const AGENT_EVENT_CAPACITY: usize = 128;

/// A worker the coordinator can schedule work on
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn agent_type(&self) -> AgentType;

    fn capabilities(&self) -> BTreeSet<String>;

    /// Prepare the agent for its first task
    async fn initialize(&self) -> Result<()>;

    /// Run one task to completion
    async fn execute(&self, task: &Task) -> Result<serde_json::Value>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Return to idle, dropping the current task. Subscribers stay attached
    /// so a re-initialized agent keeps reporting to them
    async fn stop(&self) -> Result<()>;

    fn health(&self) -> AgentHealth;

    fn state(&self) -> RuntimeState;

    /// Handle an event fanned out from a session this agent takes part in
    async fn on_event(&self, event: &Event) -> Result<()>;

    /// Events the agent emits about its own lifecycle
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

/// The work an agent actually performs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run(&self, task: &Task) -> Result<serde_json::Value>;

    async fn handle_event(&self, event: &Event) -> Result<()>;
}

#[derive(Debug)]
struct Runtime {
    state: RuntimeState,
    /// State to return to when resumed
    resume_to: RuntimeState,
    current_task: Option<String>,
    tasks_completed: u64,
    tasks_failed: u64,
    last_error: Option<String>,
    last_duration_ms: Option<u64>,
}

/// [`Agent`] implementation driving a [`TaskExecutor`] through the agent
/// state machine
pub struct BaseAgent<E> {
    id: String,
    agent_type: AgentType,
    capabilities: BTreeSet<String>,
    executor: E,
    runtime: Mutex<Runtime>,
    emitter: broadcast::Sender<Event>,
}

impl<E: TaskExecutor> BaseAgent<E> {
    pub fn new<I, S>(
        id: impl Into<String>,
        agent_type: impl Into<AgentType>,
        capabilities: I,
        executor: E,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (emitter, _) = broadcast::channel(AGENT_EVENT_CAPACITY);
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            executor,
            runtime: Mutex::new(Runtime {
                state: RuntimeState::Idle,
                resume_to: RuntimeState::Idle,
                current_task: None,
                tasks_completed: 0,
                tasks_failed: 0,
                last_error: None,
                last_duration_ms: None,
            }),
            emitter,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn emit(&self, kind: EventKind, session_id: Option<&str>, payload: serde_json::Value) {
        let mut event = Event::new(kind, self.id.clone(), payload);
        event.session_id = session_id.map(str::to_string);
        // No listeners is fine
        let _ = self.emitter.send(event);
    }

    /// Move out of `running` once the task finishes, honouring a pause that
    /// arrived mid-task.
    fn settle(runtime: &mut Runtime, next: RuntimeState) {
        if runtime.state == RuntimeState::Paused {
            runtime.resume_to = next;
        } else {
            runtime.state = next;
        }
    }
}

#[async_trait]
impl<E: TaskExecutor> Agent for BaseAgent<E> {
    fn id(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> AgentType {
        self.agent_type.clone()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }

    async fn initialize(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.state == RuntimeState::Running {
            return Err(Error::Agent(AgentError::AlreadyRunning(self.id.clone())));
        }
        runtime.state = RuntimeState::Idle;
        runtime.resume_to = RuntimeState::Idle;
        debug!("Agent {} initialized", self.id);
        Ok(())
    }

    async fn execute(&self, task: &Task) -> Result<serde_json::Value> {
        {
            let mut runtime = self.runtime.lock();
            match runtime.state {
                RuntimeState::Running => {
                    return Err(Error::Agent(AgentError::AlreadyRunning(self.id.clone())))
                }
                RuntimeState::Paused => {
                    return Err(Error::Agent(AgentError::Paused(self.id.clone())))
                }
                RuntimeState::Idle | RuntimeState::Failed => {}
            }
            runtime.state = RuntimeState::Running;
            runtime.current_task = Some(task.id.clone());
        }

        self.emit(
            EventKind::TaskStarted,
            Some(&task.session_id),
            json!({ "taskId": task.id, "taskType": task.task_type }),
        );

        let started = Instant::now();
        let result = self.executor.run(task).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(output) => {
                {
                    let mut runtime = self.runtime.lock();
                    Self::settle(&mut runtime, RuntimeState::Idle);
                    runtime.current_task = None;
                    runtime.tasks_completed += 1;
                    runtime.last_duration_ms = Some(duration_ms);
                }
                debug!("Agent {} completed task {} in {}ms", self.id, task.id, duration_ms);
                self.emit(
                    EventKind::TaskCompleted,
                    Some(&task.session_id),
                    json!({ "taskId": task.id, "durationMs": duration_ms }),
                );
                Ok(output)
            }
            Err(e) => {
                {
                    let mut runtime = self.runtime.lock();
                    Self::settle(&mut runtime, RuntimeState::Failed);
                    runtime.current_task = None;
                    runtime.tasks_failed += 1;
                    runtime.last_error = Some(e.to_string());
                    runtime.last_duration_ms = Some(duration_ms);
                }
                warn!("Agent {} failed task {}: {}", self.id, task.id, e);
                self.emit(
                    EventKind::TaskFailed,
                    Some(&task.session_id),
                    json!({ "taskId": task.id, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    async fn pause(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.state != RuntimeState::Paused {
            runtime.resume_to = runtime.state;
            runtime.state = RuntimeState::Paused;
            info!("Agent {} paused", self.id);
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.state == RuntimeState::Paused {
            runtime.state = runtime.resume_to;
            info!("Agent {} resumed ({:?})", self.id, runtime.state);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut runtime = self.runtime.lock();
            runtime.state = RuntimeState::Idle;
            runtime.resume_to = RuntimeState::Idle;
            runtime.current_task = None;
        }
        info!("Agent {} stopped", self.id);
        Ok(())
    }

    fn health(&self) -> AgentHealth {
        let runtime = self.runtime.lock();
        AgentHealth {
            agent_id: self.id.clone(),
            state: runtime.state,
            current_task: runtime.current_task.clone(),
            tasks_completed: runtime.tasks_completed,
            tasks_failed: runtime.tasks_failed,
            last_error: runtime.last_error.clone(),
            last_duration_ms: runtime.last_duration_ms,
            checked_at: chrono::Utc::now(),
        }
    }

    fn state(&self) -> RuntimeState {
        self.runtime.lock().state
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        if let Err(e) = self.executor.handle_event(event).await {
            warn!(
                "Agent {} failed to handle {} event: {}",
                self.id, event.kind, e
            );
            self.emit(
                EventKind::Error,
                event.session_id.as_deref(),
                json!({
                    "sourceEventId": event.id,
                    "sourceEventType": event.kind.as_str(),
                    "error": e.to_string(),
                }),
            );
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.emitter.subscribe()
    }
}
