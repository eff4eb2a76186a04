//! Session-scoped coordination
//!
//! A session groups participating agents around shared key/value state and
//! an ordered, bounded event log. Events broadcast into a session reach every
//! participant except the sender. Orchestration runs a list of agent-bound
//! tasks sequentially or in parallel with per-attempt timeout and retry.

use super::retry::{retry_with_backoff, Attempted};
use crate::agent::{Agent, AgentRegistry};
use crate::clock::SharedClock;
use crate::config::CoordinationConfig;
use crate::error::{Error, Result, SessionError, StorageError, TaskError};
use crate::events::EventBus;
use crate::jobs::JobGroup;
use crate::storage::{records, StateStore};
use crate::types::{
    CoordinationContext, Event, EventKind, OrchestrationOptions, OrchestrationStep, TaskResult,
    TaskStatus, COORDINATOR_ID,
};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Session used when shared state is accessed without a session id
pub const DEFAULT_SESSION_ID: &str = "default";

/// Shared-state key holding the results of the latest orchestration
pub const ORCHESTRATION_RESULTS_KEY: &str = "orchestration:results";

/// Manages coordination sessions
pub struct CoordinationManager {
    config: CoordinationConfig,
    sessions: RwLock<HashMap<String, CoordinationContext>>,
    registry: Arc<AgentRegistry>,
    bus: EventBus,
    store: Option<Arc<dyn StateStore>>,
    clock: SharedClock,
    jobs: JobGroup,
}

impl CoordinationManager {
    /// Create the manager and start its expiry sweep
    pub fn new(
        config: CoordinationConfig,
        registry: Arc<AgentRegistry>,
        bus: EventBus,
        store: Option<Arc<dyn StateStore>>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            registry,
            bus,
            store,
            clock,
            jobs: JobGroup::new("coordination"),
        });

        let weak = Arc::downgrade(&manager);
        manager.jobs.spawn_periodic(
            "session-sweep",
            manager.config.sweep_interval(),
            move || {
                let weak: Weak<Self> = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.sweep_expired();
                    }
                    Ok(())
                }
            },
        );

        manager
    }

    fn event(&self, kind: EventKind, source: &str, payload: Value) -> Event {
        let mut event = Event::new(kind, source, payload);
        event.timestamp = self.clock.now();
        event
    }

    fn resolve_agents(&self, ids: &[String]) -> Vec<Arc<dyn Agent>> {
        ids.iter()
            .filter_map(|id| {
                let agent = self.registry.get(id);
                if agent.is_none() {
                    trace!("Participant {} has no registered agent, skipping delivery", id);
                }
                agent
            })
            .collect()
    }

    /// Open a session. The initiator always becomes a participant.
    pub fn create_session(
        &self,
        session_id: &str,
        initiator_id: &str,
        participants: Vec<String>,
        shared_state: HashMap<String, Value>,
        ttl: Option<Duration>,
    ) -> Result<CoordinationContext> {
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let mut context =
            CoordinationContext::new(session_id, initiator_id, participants, shared_state, ttl);
        context.created_at = self.clock.now();
        let participants = context.participants.clone();

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(session_id) {
                return Err(Error::Session(SessionError::AlreadyExists(
                    session_id.to_string(),
                )));
            }
            sessions.insert(session_id.to_string(), context.clone());
        }

        info!(
            "Created session {} (initiator: {}, {} participant(s))",
            session_id,
            initiator_id,
            participants.len()
        );
        let created = self.event(
            EventKind::SessionCreated,
            COORDINATOR_ID,
            json!({ "initiatorId": initiator_id, "participants": participants }),
        );
        self.broadcast_event(session_id, created)?;
        self.persist_session(session_id);

        Ok(self.get_session(session_id).unwrap_or(context))
    }

    /// Add a participant. Returns false if it was already present.
    pub fn join_session(&self, session_id: &str, agent_id: &str) -> Result<bool> {
        let added = {
            let mut sessions = self.sessions.write();
            let context = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::Session(SessionError::NotFound(session_id.to_string())))?;
            context.add_participant(agent_id)
        };

        if added {
            debug!("Agent {} joined session {}", agent_id, session_id);
            let joined = self.event(
                EventKind::SessionJoined,
                agent_id,
                json!({ "agentId": agent_id }),
            );
            self.broadcast_event(session_id, joined)?;
            self.persist_session(session_id);
        }
        Ok(added)
    }

    /// Remove a participant, ending the session when nobody is left.
    ///
    /// Leaving a session the agent is not in, or one that no longer exists,
    /// is a no-op and returns false.
    pub fn leave_session(&self, session_id: &str, agent_id: &str) -> Result<bool> {
        let (removed, initiator, now_empty) = {
            let mut sessions = self.sessions.write();
            let Some(context) = sessions.get_mut(session_id) else {
                debug!("Leave for unknown session {} ignored", session_id);
                return Ok(false);
            };
            let removed = context.remove_participant(agent_id);
            (
                removed,
                context.initiator_id.clone(),
                context.participants.is_empty(),
            )
        };

        if !removed {
            return Ok(false);
        }

        debug!("Agent {} left session {}", agent_id, session_id);
        if now_empty {
            self.end_session(session_id)?;
        } else {
            let left = self.event(
                EventKind::SessionLeft,
                agent_id,
                json!({ "agentId": agent_id, "initiatorId": initiator }),
            );
            self.broadcast_event(session_id, left)?;
            self.persist_session(session_id);
        }
        Ok(true)
    }

    /// Remove a session, notifying its remaining participants
    pub fn end_session(&self, session_id: &str) -> Result<CoordinationContext> {
        let context = {
            let mut sessions = self.sessions.write();
            let mut context = sessions
                .remove(session_id)
                .ok_or_else(|| Error::Session(SessionError::NotFound(session_id.to_string())))?;

            let ended = self
                .event(
                    EventKind::SessionEnded,
                    COORDINATOR_ID,
                    json!({ "participants": context.participants }),
                )
                .in_session(session_id);
            context.record_event(ended.clone(), self.config.max_events_per_session);
            let recipients = self.resolve_agents(&context.recipients(COORDINATOR_ID));
            self.bus.publish_to_session(ended, recipients);
            self.bus.close_session(session_id);
            context
        };

        info!("Ended session {}", session_id);
        if let Some(store) = &self.store {
            if let Err(e) = records::delete_session(store.as_ref(), session_id) {
                warn!("Failed to delete stored session {}: {}", session_id, e);
            }
        }
        Ok(context)
    }

    pub fn get_session(&self, session_id: &str) -> Option<CoordinationContext> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Record an event in the session and fan it out to every participant
    /// except its source
    pub fn broadcast_event(&self, session_id: &str, mut event: Event) -> Result<()> {
        event.session_id = Some(session_id.to_string());

        let now = self.clock.now();
        let ttl = {
            let mut sessions = self.sessions.write();
            let context = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::Session(SessionError::NotFound(session_id.to_string())))?;
            context.record_event(event.clone(), self.config.max_events_per_session);
            let recipients = self.resolve_agents(&context.recipients(&event.agent_id));
            self.bus.publish_to_session(event.clone(), recipients);
            context.remaining_ttl(now)
        };

        trace!("Broadcast {} in session {}", event.kind, session_id);
        if let Some(store) = &self.store {
            if let Err(e) = records::append_session_event(store.as_ref(), &event, ttl) {
                warn!("Failed to persist event {} for session {}: {}", event.id, session_id, e);
            }
        }
        Ok(())
    }

    /// Newest events of a session in order, at most `limit` when given
    pub fn get_events(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<Event>> {
        let sessions = self.sessions.read();
        let context = sessions
            .get(session_id)
            .ok_or_else(|| Error::Session(SessionError::NotFound(session_id.to_string())))?;
        let skip = limit.map_or(0, |limit| context.events.len().saturating_sub(limit));
        Ok(context.events.iter().skip(skip).cloned().collect())
    }

    /// Receive a session's events as they are delivered
    pub fn subscribe_session(&self, session_id: &str) -> Result<broadcast::Receiver<Event>> {
        if !self.sessions.read().contains_key(session_id) {
            return Err(Error::Session(SessionError::NotFound(session_id.to_string())));
        }
        Ok(self.bus.subscribe_session(session_id))
    }

    fn ensure_default_session(&self, session_id: &str) -> Result<()> {
        if session_id != DEFAULT_SESSION_ID || self.sessions.read().contains_key(session_id) {
            return Ok(());
        }
        match self.create_session(
            DEFAULT_SESSION_ID,
            COORDINATOR_ID,
            Vec::new(),
            HashMap::new(),
            None,
        ) {
            Ok(_) | Err(Error::Session(SessionError::AlreadyExists(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Set a shared-state key and broadcast `state:updated`.
    ///
    /// `None` targets the default session, which is created on first use.
    pub fn update_shared_state(&self, session_id: Option<&str>, key: &str, value: Value) -> Result<()> {
        let session_id = session_id.unwrap_or(DEFAULT_SESSION_ID);
        self.ensure_default_session(session_id)?;

        {
            let mut sessions = self.sessions.write();
            let context = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::Session(SessionError::NotFound(session_id.to_string())))?;
            context.shared_state.insert(key.to_string(), value.clone());
        }

        let updated = self.event(
            EventKind::StateUpdated,
            COORDINATOR_ID,
            json!({ "key": key, "value": value }),
        );
        self.broadcast_event(session_id, updated)?;
        self.persist_session(session_id);
        Ok(())
    }

    pub fn get_shared_state(&self, session_id: Option<&str>, key: &str) -> Result<Option<Value>> {
        let session_id = session_id.unwrap_or(DEFAULT_SESSION_ID);
        self.ensure_default_session(session_id)?;

        let sessions = self.sessions.read();
        let context = sessions
            .get(session_id)
            .ok_or_else(|| Error::Session(SessionError::NotFound(session_id.to_string())))?;
        Ok(context.shared_state.get(key).cloned())
    }

    /// Run agent-bound tasks within a session.
    ///
    /// Sequential runs stop after the first step whose final status is
    /// failed; parallel runs collect every result. Results are also stored
    /// under [`ORCHESTRATION_RESULTS_KEY`]. A missing session is created with
    /// the step agents as participants.
    pub async fn orchestrate(
        &self,
        session_id: &str,
        steps: Vec<OrchestrationStep>,
        options: OrchestrationOptions,
    ) -> Result<Vec<TaskResult>> {
        if self.get_session(session_id).is_none() {
            let participants = steps.iter().map(|step| step.agent_id.clone()).collect();
            match self.create_session(session_id, COORDINATOR_ID, participants, HashMap::new(), None) {
                Ok(_) | Err(Error::Session(SessionError::AlreadyExists(_))) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            "Orchestrating {} task(s) in session {} ({})",
            steps.len(),
            session_id,
            if options.parallel { "parallel" } else { "sequential" }
        );

        let results = if options.parallel {
            join_all(steps.iter().map(|step| self.run_step(step, &options))).await
        } else {
            let mut results = Vec::with_capacity(steps.len());
            for step in &steps {
                let result = self.run_step(step, &options).await;
                let failed = !result.is_success();
                results.push(result);
                if failed {
                    debug!("Stopping sequential orchestration after task {}", step.task.id);
                    break;
                }
            }
            results
        };

        let stored = serde_json::to_value(&results)?;
        if let Err(e) = self.update_shared_state(Some(session_id), ORCHESTRATION_RESULTS_KEY, stored) {
            warn!("Could not store orchestration results for {}: {}", session_id, e);
        }
        Ok(results)
    }

    async fn run_step(&self, step: &OrchestrationStep, options: &OrchestrationOptions) -> TaskResult {
        let started = Instant::now();
        let task_id = step.task.id.clone();

        let Some(agent) = self.registry.get(&step.agent_id) else {
            warn!("Task {} targets unknown agent {}", task_id, step.agent_id);
            return TaskResult {
                task_id,
                agent_id: step.agent_id.clone(),
                status: TaskStatus::Failed,
                output: None,
                error: Some(format!("Agent not found: {}", step.agent_id)),
                attempts: 0,
                duration_ms: 0,
            };
        };

        let Attempted { result, attempts } = retry_with_backoff(
            &task_id,
            options.retry_attempts,
            self.config.backoff(),
            options.timeout,
            |_| {
                let agent = Arc::clone(&agent);
                let task = step.task.clone();
                async move {
                    // Detached so a timed-out attempt keeps running to completion
                    tokio::spawn(async move { agent.execute(&task).await })
                        .await
                        .map_err(|e| {
                            Error::Task(TaskError::ExecutionFailed(format!(
                                "agent task aborted: {}",
                                e
                            )))
                        })?
                }
            },
        )
        .await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(output) => TaskResult {
                task_id,
                agent_id: step.agent_id.clone(),
                status: TaskStatus::Completed,
                output: Some(output),
                error: None,
                attempts,
                duration_ms,
            },
            Err(e) => TaskResult {
                task_id,
                agent_id: step.agent_id.clone(),
                status: TaskStatus::Failed,
                output: None,
                error: Some(e.to_string()),
                attempts,
                duration_ms,
            },
        }
    }

    /// End every session whose ttl has elapsed since its first event
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|context| context.is_expired(now))
            .map(|context| context.session_id.clone())
            .collect();

        let mut ended = Vec::with_capacity(expired.len());
        for session_id in expired {
            match self.end_session(&session_id) {
                Ok(_) => ended.push(session_id),
                Err(e) => debug!("Expired session {} already gone: {}", session_id, e),
            }
        }
        if !ended.is_empty() {
            info!("Swept {} expired session(s)", ended.len());
        }
        ended
    }

    /// Load a session from the durable store into memory
    pub fn restore_session(&self, session_id: &str) -> Result<CoordinationContext> {
        let Some(store) = &self.store else {
            return Err(Error::Storage(StorageError::NotFound(
                "no durable store configured".to_string(),
            )));
        };
        if self.sessions.read().contains_key(session_id) {
            return Err(Error::Session(SessionError::AlreadyExists(session_id.to_string())));
        }

        let context =
            records::load_session(store.as_ref(), session_id, self.config.max_events_per_session)?
                .ok_or_else(|| Error::Session(SessionError::NotFound(session_id.to_string())))?;

        let mut sessions = self.sessions.write();
        if sessions.contains_key(session_id) {
            return Err(Error::Session(SessionError::AlreadyExists(session_id.to_string())));
        }
        sessions.insert(session_id.to_string(), context.clone());
        info!(
            "Restored session {} with {} event(s)",
            session_id,
            context.events.len()
        );
        Ok(context)
    }

    fn persist_session(&self, session_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(context) = self.get_session(session_id) else {
            return;
        };
        if let Err(e) = records::save_session(store.as_ref(), &context, self.clock.now()) {
            warn!("Failed to persist session {}: {}", session_id, e);
        }
    }

    /// Stop the expiry sweep
    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{scripted_agent, ScriptedAgent, ScriptedExecutor};
    use crate::clock::{system_clock, ManualClock};
    use crate::config::RegistryConfig;
    use crate::storage::{MockStateStore, SqliteStateStore};
    use crate::types::Task;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    struct Fixture {
        manager: Arc<CoordinationManager>,
        registry: Arc<AgentRegistry>,
        bus: EventBus,
    }

    fn fixture_with(store: Option<Arc<dyn StateStore>>, clock: SharedClock) -> Fixture {
        crate::init_test_tracing();
        let bus = EventBus::new(8, Duration::from_secs(1));
        let registry = AgentRegistry::new(RegistryConfig::default(), bus.clone(), clock.clone());
        let manager = CoordinationManager::new(
            CoordinationConfig::default(),
            Arc::clone(&registry),
            bus.clone(),
            store,
            clock,
        );
        Fixture {
            manager,
            registry,
            bus,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None, system_clock())
    }

    fn add_agent(fixture: &Fixture, id: &str, executor: ScriptedExecutor) -> Arc<ScriptedAgent> {
        let agent = scripted_agent(id, "analysis", executor);
        fixture
            .registry
            .register(agent.clone(), json!({ "name": id, "version": "1.0.0" }))
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn test_create_session_includes_initiator_and_notifies() {
        let fx = fixture();
        let lead = add_agent(&fx, "lead", ScriptedExecutor::succeeding());
        let worker = add_agent(&fx, "worker", ScriptedExecutor::succeeding());

        let context = fx
            .manager
            .create_session("s1", "lead", vec!["worker".to_string()], HashMap::new(), None)
            .unwrap();
        assert_eq!(context.participants, vec!["lead", "worker"]);

        let dup = fx
            .manager
            .create_session("s1", "worker", Vec::new(), HashMap::new(), None);
        assert!(matches!(dup, Err(Error::Session(SessionError::AlreadyExists(_)))));

        fx.bus.flush_session("s1").await;
        assert_eq!(lead.executor().received_kinds(), vec![EventKind::SessionCreated]);
        assert_eq!(worker.executor().received_kinds(), vec![EventKind::SessionCreated]);
    }

    #[tokio::test]
    async fn test_join_is_idempotent_and_leave_last_ends_session() {
        let fx = fixture();
        fx.manager
            .create_session("s1", "lead", Vec::new(), HashMap::new(), None)
            .unwrap();

        assert!(fx.manager.join_session("s1", "worker").unwrap());
        assert!(!fx.manager.join_session("s1", "worker").unwrap());
        assert_eq!(
            fx.manager.get_session("s1").unwrap().participants,
            vec!["lead", "worker"]
        );

        assert!(fx.manager.leave_session("s1", "lead").unwrap());
        assert_eq!(fx.manager.get_session("s1").unwrap().initiator_id, "worker");
        assert!(!fx.manager.leave_session("s1", "lead").unwrap());

        let mut events = fx.bus.subscribe();
        assert!(fx.manager.leave_session("s1", "worker").unwrap());
        assert!(fx.manager.get_session("s1").is_none());
        assert_eq!(events.recv().await.unwrap().kind, EventKind::SessionEnded);
        assert!(!fx.manager.leave_session("s1", "worker").unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_survives_failing_handler() {
        let fx = fixture();
        let sender = add_agent(&fx, "sender", ScriptedExecutor::succeeding());
        let broken = add_agent(
            &fx,
            "broken",
            ScriptedExecutor {
                fail_events: true,
                ..ScriptedExecutor::default()
            },
        );
        let healthy = add_agent(&fx, "healthy", ScriptedExecutor::succeeding());
        fx.manager
            .create_session(
                "s1",
                "sender",
                vec!["broken".to_string(), "healthy".to_string()],
                HashMap::new(),
                None,
            )
            .unwrap();

        let note = Event::new(EventKind::Custom("note".to_string()), "sender", json!({}));
        fx.manager.broadcast_event("s1", note).unwrap();
        fx.bus.flush_session("s1").await;

        let custom = EventKind::Custom("note".to_string());
        assert!(!sender.executor().received_kinds().contains(&custom));
        assert!(broken.executor().received_kinds().contains(&custom));
        assert!(healthy.executor().received_kinds().contains(&custom));
        assert_eq!(fx.manager.get_events("s1", Some(1)).unwrap()[0].kind, custom);
    }

    #[tokio::test]
    async fn test_shared_state_defaults_to_auto_created_session() {
        let fx = fixture();
        assert!(fx.manager.get_session(DEFAULT_SESSION_ID).is_none());

        fx.manager
            .update_shared_state(None, "phase", json!("indexing"))
            .unwrap();

        let default = fx.manager.get_session(DEFAULT_SESSION_ID).unwrap();
        assert_eq!(default.initiator_id, COORDINATOR_ID);
        assert_eq!(
            fx.manager.get_shared_state(None, "phase").unwrap(),
            Some(json!("indexing"))
        );

        let missing = fx.manager.update_shared_state(Some("nope"), "k", json!(1));
        assert!(matches!(missing, Err(Error::Session(SessionError::NotFound(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_orchestration_stops_at_first_failure() {
        let fx = fixture();
        add_agent(&fx, "ok", ScriptedExecutor::succeeding());
        let bad = add_agent(&fx, "bad", ScriptedExecutor::failing());
        let never = add_agent(&fx, "never", ScriptedExecutor::succeeding());

        let steps = vec![
            OrchestrationStep::new("ok", Task::new("analysis", "flow")),
            OrchestrationStep::new("bad", Task::new("analysis", "flow")),
            OrchestrationStep::new("never", Task::new("analysis", "flow")),
        ];
        let results = fx
            .manager
            .orchestrate("flow", steps, OrchestrationOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_success());
        assert_eq!(results[1].status, TaskStatus::Failed);
        assert_eq!(results[1].attempts, 3);
        assert_eq!(bad.executor().runs.load(Ordering::SeqCst), 3);
        assert_eq!(never.executor().runs.load(Ordering::SeqCst), 0);

        let stored = fx
            .manager
            .get_shared_state(Some("flow"), ORCHESTRATION_RESULTS_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(stored.as_array().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_orchestration_collects_every_result() {
        let fx = fixture();
        add_agent(&fx, "a", ScriptedExecutor::succeeding());
        add_agent(&fx, "b", ScriptedExecutor::failing());

        let steps = vec![
            OrchestrationStep::new("a", Task::new("analysis", "flow")),
            OrchestrationStep::new("b", Task::new("analysis", "flow")),
            OrchestrationStep::new("ghost", Task::new("analysis", "flow")),
        ];
        let options = OrchestrationOptions {
            parallel: true,
            retry_attempts: 2,
            ..OrchestrationOptions::default()
        };
        let results = fx.manager.orchestrate("flow", steps, options).await.unwrap();

        let statuses: Vec<TaskStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Failed]
        );
        assert_eq!(results[1].attempts, 2);
        assert_eq!(results[2].attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orchestration_times_out_slow_task() {
        let fx = fixture();
        add_agent(&fx, "slow", ScriptedExecutor::slow(Duration::from_secs(60)));

        let options = OrchestrationOptions {
            timeout: Duration::from_millis(100),
            retry_attempts: 1,
            ..OrchestrationOptions::default()
        };
        let results = fx
            .manager
            .orchestrate(
                "flow",
                vec![OrchestrationStep::new("slow", Task::new("analysis", "flow"))],
                options,
            )
            .await
            .unwrap();

        assert_eq!(results[0].status, TaskStatus::Failed);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_sweep_ends_sessions_past_ttl() {
        let clock = ManualClock::default();
        let fx = fixture_with(None, Arc::new(clock.clone()));
        fx.manager
            .create_session(
                "short",
                "lead",
                Vec::new(),
                HashMap::new(),
                Some(Duration::from_secs(30)),
            )
            .unwrap();
        fx.manager
            .create_session("long", "lead", Vec::new(), HashMap::new(), None)
            .unwrap();

        clock.advance(Duration::from_secs(31));
        assert_eq!(fx.manager.sweep_expired(), vec!["short".to_string()]);
        assert!(fx.manager.get_session("short").is_none());
        assert!(fx.manager.get_session("long").is_some());
    }

    #[tokio::test]
    async fn test_restore_session_from_store() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());

        let first = fixture_with(Some(Arc::clone(&store)), system_clock());
        first
            .manager
            .create_session("s1", "lead", vec!["worker".to_string()], HashMap::new(), None)
            .unwrap();
        first
            .manager
            .update_shared_state(Some("s1"), "phase", json!("verify"))
            .unwrap();

        let second = fixture_with(Some(store), system_clock());
        let restored = second.manager.restore_session("s1").unwrap();
        assert_eq!(restored.participants, vec!["lead", "worker"]);
        assert_eq!(restored.shared_state["phase"], "verify");
        assert_eq!(restored.events.len(), 2);

        let again = second.manager.restore_session("s1");
        assert!(matches!(again, Err(Error::Session(SessionError::AlreadyExists(_)))));
        let missing = second.manager.restore_session("nope");
        assert!(matches!(missing, Err(Error::Session(SessionError::NotFound(_)))));
    }

    #[tokio::test]
    async fn test_store_failures_do_not_break_sessions() {
        let failure = || Error::Storage(StorageError::Database("disk full".to_string()));
        let mut store = MockStateStore::new();
        store.expect_set_fields().returning(move |_, _| Err(failure()));
        store.expect_append_ordered().returning(move |_, _, _| Err(failure()));
        store.expect_expire().returning(move |_, _| Err(failure()));
        store.expect_delete().returning(move |_| Err(failure()));

        let fx = fixture_with(Some(Arc::new(store)), system_clock());
        tokio_test::assert_ok!(fx
            .manager
            .create_session("s1", "lead", Vec::new(), HashMap::new(), None));
        tokio_test::assert_ok!(fx.manager.update_shared_state(Some("s1"), "k", json!(1)));
        tokio_test::assert_ok!(fx.manager.end_session("s1"));
    }
}
