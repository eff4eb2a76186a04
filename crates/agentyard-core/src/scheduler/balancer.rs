//! Load-balanced task scheduler
//!
//! Tasks wait in a priority queue (higher priority first, then submission
//! order) until a capable agent with spare capacity is available. Every
//! state change that can free capacity or add work re-runs assignment within
//! the same critical section, so queue, task and agent state never disagree.

use super::strategy::{self, Strategy};
use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::error::{AgentError, Error, Result, TaskError};
use crate::events::EventBus;
use crate::jobs::JobGroup;
use crate::storage::{records, StateStore};
use crate::types::{
    AgentStatus, Event, EventKind, HandoffContext, LoadBalancerMetrics, PoolAgent, PoolAgentSpec,
    Task, TaskRequest, TaskStatus,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hook run once after an agent has been declared dead
///
/// The probe only notifies; the agent counts as recovered when its next
/// heartbeat arrives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecoveryProbe: Send + Sync {
    async fn probe(&self, agent_id: &str) -> Result<()>;
}

/// Optional collaborators of the scheduler
#[derive(Clone, Default)]
pub struct SchedulerHooks {
    pub store: Option<Arc<dyn StateStore>>,
    pub recovery_probe: Option<Arc<dyn RecoveryProbe>>,
}

type QueueKey = (Reverse<i32>, u64);

/// Finished tasks kept for lookup after they leave the live set
const FINISHED_TASK_HISTORY: usize = 1024;

enum Outcome {
    Completed { duration: Option<Duration> },
    Failed { error: String },
}

/// Tasks taken away from an agent that lost its slots
#[derive(Default)]
struct Released {
    requeued: Vec<String>,
    exhausted: Vec<String>,
    events: Vec<Event>,
}

#[derive(Default)]
struct SchedulerState {
    strategy: Strategy,
    /// Registration order
    agents: Vec<PoolAgent>,
    /// Queued and assigned tasks only
    tasks: HashMap<String, Task>,
    /// Assigned task ids per agent
    owned: HashMap<String, BTreeSet<String>>,
    finished: HashMap<String, Task>,
    finished_order: VecDeque<String>,
    queue: BTreeMap<QueueKey, String>,
    next_seq: u64,
    completed_tasks: u64,
    failed_tasks: u64,
    handoff_count: u64,
}

fn stamped(kind: EventKind, payload: serde_json::Value, now: chrono::DateTime<chrono::Utc>) -> Event {
    let mut event = Event::system(kind, payload);
    event.timestamp = now;
    event
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl SchedulerState {
    fn agent_index(&self, id: &str) -> Option<usize> {
        self.agents.iter().position(|agent| agent.id == id)
    }

    fn agent_mut(&mut self, id: &str) -> Option<&mut PoolAgent> {
        self.agents.iter_mut().find(|agent| agent.id == id)
    }

    fn lookup(&self, task_id: &str) -> Option<&Task> {
        self.tasks
            .get(task_id)
            .or_else(|| self.finished.get(task_id))
    }

    fn enqueue(&mut self, task_id: &str, priority: i32) {
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.queue.insert(key, task_id.to_string());
    }

    fn disown(&mut self, agent_id: &str, task_id: &str) {
        if let Some(ids) = self.owned.get_mut(agent_id) {
            ids.remove(task_id);
            if ids.is_empty() {
                self.owned.remove(agent_id);
            }
        }
    }

    /// Move a terminal task out of the live set into the bounded history
    fn retire(&mut self, task_id: &str) {
        let Some(task) = self.tasks.remove(task_id) else {
            return;
        };
        self.finished.insert(task.id.clone(), task);
        self.finished_order.push_back(task_id.to_string());
        while self.finished_order.len() > FINISHED_TASK_HISTORY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    /// Take every task away from `agent_id`. Tasks with attempts left go
    /// back in the queue with their attempt count untouched; the rest fail.
    fn release_tasks_of(
        &mut self,
        agent_id: &str,
        reason: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Released {
        let ids = self.owned.remove(agent_id).unwrap_or_default();
        let mut owned: Vec<(Reverse<i32>, chrono::DateTime<chrono::Utc>, String)> = ids
            .into_iter()
            .filter_map(|id| self.tasks.get(&id))
            .map(|task| (Reverse(task.priority), task.created_at, task.id.clone()))
            .collect();
        owned.sort();

        let mut released = Released::default();
        for (_, _, task_id) in owned {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            task.assigned_agent = None;
            task.assigned_at = None;

            if task.can_retry() {
                task.status = TaskStatus::Queued;
                let priority = task.priority;
                self.enqueue(&task_id, priority);
                released.requeued.push(task_id);
                continue;
            }

            let error = format!("{} ({})", reason, agent_id);
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.last_error = Some(error.clone());
            warn!(
                "Task {} failed permanently after {} attempt(s): {}",
                task_id, task.attempts, error
            );
            released.events.push(
                stamped(
                    EventKind::TaskFailed,
                    json!({
                        "taskId": task_id,
                        "agentId": agent_id,
                        "attempts": task.attempts,
                        "maxAttempts": task.max_attempts,
                        "error": error,
                    }),
                    now,
                )
                .in_session(task.session_id.clone()),
            );
            self.failed_tasks += 1;
            self.retire(&task_id);
            released.exhausted.push(task_id);
        }
        released
    }

    /// Give back one unit of load, dropping the session unless another of
    /// the agent's assigned tasks still belongs to it
    fn release_slot(&mut self, agent_id: &str, task_id: &str, session_id: &str) {
        self.disown(agent_id, task_id);
        let session_still_used = self.owned.get(agent_id).is_some_and(|ids| {
            ids.iter().any(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|task| task.session_id == session_id)
            })
        });
        if let Some(agent) = self.agent_mut(agent_id) {
            agent.load = agent.load.saturating_sub(1);
            if !session_still_used {
                agent.current_sessions.remove(session_id);
            }
            agent.refresh_status();
        }
    }

    /// Match queued tasks to agents in priority order
    fn assign_queued(&mut self, now: chrono::DateTime<chrono::Utc>, events: &mut Vec<Event>) -> usize {
        let pending: Vec<(QueueKey, String)> = self
            .queue
            .iter()
            .map(|(key, task_id)| (*key, task_id.clone()))
            .collect();

        let mut assigned = 0;
        for (key, task_id) in pending {
            let chosen = {
                let Some(task) = self.tasks.get(&task_id) else {
                    self.queue.remove(&key);
                    continue;
                };
                if !task.fits_deadline(now) {
                    continue;
                }
                let candidates = self.agents.iter().filter(|agent| {
                    agent.status.is_schedulable()
                        && agent.has_capacity()
                        && agent.supports_all(&task.required_capabilities)
                });
                strategy::select(self.strategy, candidates, task).map(|agent| agent.id.clone())
            };
            let Some(agent_id) = chosen else {
                continue;
            };

            self.queue.remove(&key);
            let Some(task) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            task.status = TaskStatus::Assigned;
            task.assigned_agent = Some(agent_id.clone());
            task.assigned_at = Some(now);
            task.attempts += 1;
            let attempt = task.attempts;
            let session_id = task.session_id.clone();

            self.owned
                .entry(agent_id.clone())
                .or_default()
                .insert(task_id.clone());
            if let Some(agent) = self.agent_mut(&agent_id) {
                agent.load += 1;
                agent.current_sessions.insert(session_id.clone());
                agent.refresh_status();
            }

            debug!("Assigned task {} to {} (attempt {})", task_id, agent_id, attempt);
            events.push(
                stamped(
                    EventKind::TaskAssigned,
                    json!({ "taskId": task_id, "agentId": agent_id, "attempt": attempt }),
                    now,
                )
                .in_session(session_id),
            );
            assigned += 1;
        }
        assigned
    }
}

/// Priority task queue and agent pool
pub struct TaskScheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    bus: EventBus,
    clock: SharedClock,
    hooks: SchedulerHooks,
    jobs: JobGroup,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, bus: EventBus, clock: SharedClock) -> Arc<Self> {
        Self::with_hooks(config, bus, clock, SchedulerHooks::default())
    }

    /// Create the scheduler and start dead-agent detection
    pub fn with_hooks(
        config: SchedulerConfig,
        bus: EventBus,
        clock: SharedClock,
        hooks: SchedulerHooks,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            state: Mutex::new(SchedulerState {
                strategy: config.strategy,
                ..SchedulerState::default()
            }),
            config,
            bus,
            clock,
            hooks,
            jobs: JobGroup::new("scheduler"),
        });

        let weak = Arc::downgrade(&scheduler);
        scheduler.jobs.spawn_periodic(
            "dead-agent-detection",
            scheduler.config.heartbeat_interval(),
            move || {
                let weak: Weak<Self> = weak.clone();
                async move {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.detect_dead_agents();
                    }
                    Ok(())
                }
            },
        );

        scheduler
    }

    fn publish_all(&self, events: Vec<Event>) {
        for event in events {
            self.bus.publish(event);
        }
    }

    /// Add an agent to the pool
    pub fn register_agent(&self, spec: PoolAgentSpec) -> Result<PoolAgent> {
        let now = self.clock.now();
        let agent = {
            let mut state = self.state.lock();
            if state.agent_index(&spec.id).is_some() {
                return Err(Error::Agent(AgentError::Duplicate(spec.id)));
            }
            if state.agents.len() >= self.config.max_agents {
                return Err(Error::Agent(AgentError::CapacityExceeded {
                    max: self.config.max_agents,
                }));
            }
            if spec.id.trim().is_empty() {
                return Err(Error::Agent(AgentError::Validation(
                    "agent id must not be empty".to_string(),
                )));
            }
            if spec.max_load == 0 {
                return Err(Error::Agent(AgentError::Validation(format!(
                    "{}: maxLoad must be at least 1",
                    spec.id
                ))));
            }

            let agent = PoolAgent::from_spec(spec, now);
            let mut events = vec![stamped(
                EventKind::AgentRegistered,
                json!({
                    "agentId": agent.id,
                    "agentType": agent.agent_type.as_str(),
                    "capabilities": agent.capabilities,
                    "maxLoad": agent.max_load,
                }),
                now,
            )];
            let id = agent.id.clone();
            state.agents.push(agent);
            info!("Added agent {} to pool ({} total)", id, state.agents.len());

            state.assign_queued(now, &mut events);
            self.publish_all(events);
            state
                .agents
                .iter()
                .find(|agent| agent.id == id)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("agent {} vanished during registration", id)))?
        };

        if let Some(store) = &self.hooks.store {
            if let Err(e) = records::save_pool_agent(store.as_ref(), &agent) {
                warn!("Failed to persist pool agent {}: {}", agent.id, e);
            }
        }
        Ok(agent)
    }

    /// Remove an agent, returning its assigned tasks to the queue
    pub fn unregister_agent(&self, agent_id: &str) -> Result<PoolAgent> {
        let now = self.clock.now();
        let removed = {
            let mut state = self.state.lock();
            let index = state
                .agent_index(agent_id)
                .ok_or_else(|| Error::Agent(AgentError::NotFound(agent_id.to_string())))?;
            let released = state.release_tasks_of(agent_id, "agent unregistered", now);
            let removed = state.agents.remove(index);

            info!(
                "Removed agent {} from pool, requeued {} task(s)",
                agent_id,
                released.requeued.len()
            );
            let mut events = vec![stamped(
                EventKind::AgentUnregistered,
                json!({
                    "agentId": agent_id,
                    "requeuedTasks": released.requeued,
                    "failedTasks": released.exhausted,
                }),
                now,
            )];
            events.extend(released.events);
            state.assign_queued(now, &mut events);
            self.publish_all(events);
            removed
        };

        if let Some(store) = &self.hooks.store {
            if let Err(e) = records::delete_pool_agent(store.as_ref(), agent_id) {
                warn!("Failed to delete stored pool agent {}: {}", agent_id, e);
            }
        }
        Ok(removed)
    }

    /// Record a heartbeat. A dead agent comes back idle.
    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let revived = {
            let agent = state
                .agent_mut(agent_id)
                .ok_or_else(|| Error::Agent(AgentError::NotFound(agent_id.to_string())))?;
            agent.last_heartbeat = now;
            if agent.status == AgentStatus::Dead {
                agent.status = AgentStatus::Idle;
                agent.refresh_status();
                true
            } else {
                false
            }
        };

        if revived {
            info!("Agent {} recovered", agent_id);
            let mut events = vec![stamped(
                EventKind::AgentRecovered,
                json!({ "agentId": agent_id }),
                now,
            )];
            state.assign_queued(now, &mut events);
            self.publish_all(events);
        }
        Ok(())
    }

    /// Exclude an agent from scheduling, or return it to service
    pub fn set_agent_paused(&self, agent_id: &str, paused: bool) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let agent = state
            .agent_mut(agent_id)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(agent_id.to_string())))?;

        if paused {
            if agent.status == AgentStatus::Dead {
                return Err(Error::Agent(AgentError::Validation(format!(
                    "{}: cannot pause a dead agent",
                    agent_id
                ))));
            }
            agent.status = AgentStatus::Paused;
            info!("Paused agent {}", agent_id);
            return Ok(());
        }

        if agent.status != AgentStatus::Paused {
            return Ok(());
        }
        agent.status = AgentStatus::Idle;
        agent.refresh_status();
        info!("Resumed agent {}", agent_id);

        let mut events = Vec::new();
        state.assign_queued(now, &mut events);
        self.publish_all(events);
        Ok(())
    }

    /// Queue a task and try to assign it right away
    pub fn submit_task(&self, request: TaskRequest) -> Task {
        let now = self.clock.now();
        let task = request.into_task_with_default_attempts(now, self.config.default_max_attempts);
        let task_id = task.id.clone();

        let mut state = self.state.lock();
        let mut events = vec![stamped(
            EventKind::TaskSubmitted,
            json!({
                "taskId": task.id,
                "taskType": task.task_type,
                "priority": task.priority,
            }),
            now,
        )
        .in_session(task.session_id.clone())];
        debug!("Submitted task {} ({})", task.id, task.task_type);

        state.enqueue(&task.id, task.priority);
        state.tasks.insert(task.id.clone(), task.clone());
        state.assign_queued(now, &mut events);
        self.publish_all(events);

        state.lookup(&task_id).cloned().unwrap_or(task)
    }

    /// Mark an assigned task completed
    pub fn complete_task(&self, task_id: &str, duration: Option<Duration>) -> Result<Task> {
        self.settle(task_id, None, Outcome::Completed { duration })
    }

    /// Mark an assigned task failed; it is retried while attempts remain
    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<Task> {
        self.settle(
            task_id,
            None,
            Outcome::Failed {
                error: error.to_string(),
            },
        )
    }

    /// Completion reported by a specific agent. Rejected with `NotAssigned`
    /// if the task has since moved elsewhere.
    pub fn report_completion(
        &self,
        agent_id: &str,
        task_id: &str,
        duration: Option<Duration>,
    ) -> Result<Task> {
        self.settle(task_id, Some(agent_id), Outcome::Completed { duration })
    }

    pub fn report_failure(&self, agent_id: &str, task_id: &str, error: &str) -> Result<Task> {
        self.settle(
            task_id,
            Some(agent_id),
            Outcome::Failed {
                error: error.to_string(),
            },
        )
    }

    fn settle(&self, task_id: &str, reporter: Option<&str>, outcome: Outcome) -> Result<Task> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut events = Vec::new();

        let (agent_id, session_id) = {
            let task = state
                .lookup(task_id)
                .ok_or_else(|| Error::Task(TaskError::NotFound(task_id.to_string())))?;
            let owner = match (&task.status, &task.assigned_agent) {
                (TaskStatus::Assigned, Some(owner)) => owner.clone(),
                _ => return Err(Error::Task(TaskError::NotAssigned(task_id.to_string()))),
            };
            if reporter.is_some_and(|reporter| reporter != owner) {
                return Err(Error::Task(TaskError::NotAssigned(task_id.to_string())));
            }
            (owner, task.session_id.clone())
        };

        match outcome {
            Outcome::Completed { duration } => {
                let elapsed_ms = {
                    let Some(task) = state.tasks.get_mut(task_id) else {
                        return Err(Error::Task(TaskError::NotFound(task_id.to_string())));
                    };
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(now);
                    match duration {
                        Some(duration) => millis(duration),
                        None => task
                            .assigned_at
                            .map(|at| (now - at).num_milliseconds().max(0) as u64)
                            .unwrap_or(0),
                    }
                };
                state.completed_tasks += 1;
                state.release_slot(&agent_id, task_id, &session_id);
                state.retire(task_id);
                if let Some(agent) = state.agent_mut(&agent_id) {
                    agent.total_tasks_completed += 1;
                    let n = agent.total_tasks_completed as f64;
                    agent.average_task_duration_ms =
                        (agent.average_task_duration_ms * (n - 1.0) + elapsed_ms as f64) / n;
                }

                info!("Task {} completed by {} in {}ms", task_id, agent_id, elapsed_ms);
                events.push(
                    stamped(
                        EventKind::TaskCompleted,
                        json!({ "taskId": task_id, "agentId": agent_id, "durationMs": elapsed_ms }),
                        now,
                    )
                    .in_session(session_id),
                );
            }
            Outcome::Failed { error } => {
                let (retry, attempts, max_attempts, priority) = {
                    let Some(task) = state.tasks.get_mut(task_id) else {
                        return Err(Error::Task(TaskError::NotFound(task_id.to_string())));
                    };
                    task.last_error = Some(error.clone());
                    let retry = task.can_retry();
                    if retry {
                        task.status = TaskStatus::Queued;
                        task.assigned_agent = None;
                        task.assigned_at = None;
                    } else {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(now);
                    }
                    (retry, task.attempts, task.max_attempts, task.priority)
                };

                state.release_slot(&agent_id, task_id, &session_id);
                if let Some(agent) = state.agent_mut(&agent_id) {
                    let n = agent.total_tasks_completed as f64;
                    agent.error_rate = (agent.error_rate * n + 1.0) / (n + 1.0);
                }

                let payload = json!({
                    "taskId": task_id,
                    "agentId": agent_id,
                    "attempts": attempts,
                    "maxAttempts": max_attempts,
                    "error": error,
                });
                if retry {
                    warn!(
                        "Task {} failed on {} (attempt {}/{}), requeueing: {}",
                        task_id, agent_id, attempts, max_attempts, error
                    );
                    state.enqueue(task_id, priority);
                    events.push(stamped(EventKind::TaskRetry, payload, now).in_session(session_id));
                } else {
                    warn!(
                        "Task {} failed permanently after {} attempt(s): {}",
                        task_id, attempts, error
                    );
                    state.failed_tasks += 1;
                    state.retire(task_id);
                    events.push(stamped(EventKind::TaskFailed, payload, now).in_session(session_id));
                }
            }
        }

        state.assign_queued(now, &mut events);
        self.publish_all(events);
        state
            .lookup(task_id)
            .cloned()
            .ok_or_else(|| Error::Task(TaskError::NotFound(task_id.to_string())))
    }

    /// Declare agents dead whose last heartbeat is older than the heartbeat
    /// timeout and reassign their tasks
    pub fn detect_dead_agents(&self) -> Vec<String> {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout())
            .unwrap_or(chrono::Duration::MAX);

        let dead = {
            let mut state = self.state.lock();
            let dead: Vec<String> = state
                .agents
                .iter()
                .filter(|agent| agent.status != AgentStatus::Dead)
                .filter(|agent| now - agent.last_heartbeat > timeout)
                .map(|agent| agent.id.clone())
                .collect();
            if dead.is_empty() {
                return dead;
            }

            let mut events = Vec::new();
            for agent_id in &dead {
                let released = state.release_tasks_of(agent_id, "agent declared dead", now);
                if let Some(agent) = state.agent_mut(agent_id) {
                    agent.status = AgentStatus::Dead;
                    agent.load = 0;
                    agent.current_sessions.clear();
                }
                warn!(
                    "Agent {} missed its heartbeat deadline, requeued {} task(s), failed {}",
                    agent_id,
                    released.requeued.len(),
                    released.exhausted.len()
                );
                events.push(stamped(
                    EventKind::AgentDead,
                    json!({
                        "agentId": agent_id,
                        "requeuedTasks": released.requeued,
                        "failedTasks": released.exhausted,
                    }),
                    now,
                ));
                events.extend(released.events);
            }
            state.assign_queued(now, &mut events);
            self.publish_all(events);
            dead
        };

        if self.config.auto_recovery {
            for agent_id in &dead {
                self.schedule_recovery_probe(agent_id);
            }
        }
        dead
    }

    fn schedule_recovery_probe(&self, agent_id: &str) {
        let agent_id = agent_id.to_string();
        let bus = self.bus.clone();
        let clock = Arc::clone(&self.clock);
        let probe = self.hooks.recovery_probe.clone();

        self.jobs.spawn_once(
            &format!("recovery-probe:{}", agent_id),
            self.config.recovery_delay(),
            async move {
                debug!("Probing dead agent {}", agent_id);
                bus.publish(stamped(
                    EventKind::AgentRecoveryProbe,
                    json!({ "agentId": agent_id }),
                    clock.now(),
                ));
                if let Some(probe) = probe {
                    probe.probe(&agent_id).await?;
                }
                Ok(())
            },
        );
    }

    /// Move a session from one agent to another.
    ///
    /// The session's assigned tasks and their load move with it. The target
    /// must be idle or active with room for them. Returns the number of
    /// tasks moved.
    pub fn initiate_handoff(&self, handoff: HandoffContext) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let from_index = state
            .agent_index(&handoff.from_agent)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(handoff.from_agent.clone())))?;
        let to_index = match state.agent_index(&handoff.to_agent) {
            Some(index) if state.agents[index].status.is_schedulable() => index,
            _ => {
                return Err(Error::Agent(AgentError::HandoffTargetUnavailable(
                    handoff.to_agent.clone(),
                )))
            }
        };
        if from_index == to_index {
            return Err(Error::Agent(AgentError::Validation(
                "handoff source and target are the same agent".to_string(),
            )));
        }
        if !state.agents[from_index]
            .current_sessions
            .contains(&handoff.session_id)
        {
            return Err(Error::Agent(AgentError::Validation(format!(
                "{} does not hold session {}",
                handoff.from_agent, handoff.session_id
            ))));
        }

        let moving: Vec<String> = state
            .owned
            .get(&handoff.from_agent)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        state
                            .tasks
                            .get(*id)
                            .is_some_and(|task| task.session_id == handoff.session_id)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let count = u32::try_from(moving.len()).unwrap_or(u32::MAX);

        let target = &state.agents[to_index];
        if target.load.saturating_add(count) > target.max_load {
            return Err(Error::Agent(AgentError::HandoffTargetUnavailable(format!(
                "{} lacks capacity for {} task(s)",
                handoff.to_agent, count
            ))));
        }

        for task_id in &moving {
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.assigned_agent = Some(handoff.to_agent.clone());
            }
            state.disown(&handoff.from_agent, task_id);
            state
                .owned
                .entry(handoff.to_agent.clone())
                .or_default()
                .insert(task_id.clone());
        }
        {
            let from = &mut state.agents[from_index];
            from.current_sessions.remove(&handoff.session_id);
            from.load = from.load.saturating_sub(count);
            from.refresh_status();
        }
        {
            let to = &mut state.agents[to_index];
            to.current_sessions.insert(handoff.session_id.clone());
            to.load += count;
            to.refresh_status();
        }
        state.handoff_count += 1;

        info!(
            "Handed off session {} from {} to {} ({}), {} task(s) moved",
            handoff.session_id, handoff.from_agent, handoff.to_agent, handoff.reason, count
        );
        let mut events = vec![stamped(
            EventKind::HandoffInitiated,
            json!({
                "sessionId": handoff.session_id,
                "fromAgent": handoff.from_agent,
                "toAgent": handoff.to_agent,
                "reason": handoff.reason,
                "context": handoff.context,
                "priority": handoff.priority,
                "estimatedDurationMs": handoff.estimated_duration_ms,
                "movedTasks": moving,
            }),
            now,
        )
        .in_session(handoff.session_id.clone())];
        state.assign_queued(now, &mut events);
        self.publish_all(events);

        Ok(moving.len())
    }

    /// Re-run assignment, returning how many tasks were assigned
    pub fn run_assignment(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut events = Vec::new();
        let assigned = state.assign_queued(now, &mut events);
        self.publish_all(events);
        assigned
    }

    pub fn metrics(&self) -> LoadBalancerMetrics {
        let state = self.state.lock();

        let live: Vec<&PoolAgent> = state
            .agents
            .iter()
            .filter(|agent| agent.status != AgentStatus::Dead)
            .collect();
        let capacity: u64 = live.iter().map(|agent| u64::from(agent.max_load)).sum();
        let load: u64 = live.iter().map(|agent| u64::from(agent.load)).sum();

        let experienced: Vec<f64> = state
            .agents
            .iter()
            .filter(|agent| agent.total_tasks_completed > 0)
            .map(|agent| agent.average_task_duration_ms)
            .collect();
        let average_task_duration_ms = if experienced.is_empty() {
            0.0
        } else {
            experienced.iter().sum::<f64>() / experienced.len() as f64
        };

        LoadBalancerMetrics {
            total_agents: state.agents.len(),
            active_agents: live.len(),
            queued_tasks: state.queue.len(),
            running_tasks: state.owned.values().map(BTreeSet::len).sum(),
            completed_tasks: state.completed_tasks,
            failed_tasks: state.failed_tasks,
            average_task_duration_ms,
            system_load: if capacity == 0 {
                0.0
            } else {
                load as f64 / capacity as f64
            },
            dead_agent_count: state.agents.len() - live.len(),
            handoff_count: state.handoff_count,
        }
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().lookup(task_id).cloned()
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<PoolAgent> {
        self.state
            .lock()
            .agents
            .iter()
            .find(|agent| agent.id == agent_id)
            .cloned()
    }

    /// Pool agents in registration order
    pub fn list_agents(&self) -> Vec<PoolAgent> {
        self.state.lock().agents.clone()
    }

    /// Queued task ids in the order they will be considered
    pub fn queued_tasks(&self) -> Vec<String> {
        self.state.lock().queue.values().cloned().collect()
    }

    pub fn strategy(&self) -> Strategy {
        self.state.lock().strategy
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        let mut state = self.state.lock();
        if state.strategy != strategy {
            info!("Scheduler strategy {:?} -> {:?}", state.strategy, strategy);
            state.strategy = strategy;
        }
    }

    /// Stop dead-agent detection and pending recovery probes
    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
    }
}
