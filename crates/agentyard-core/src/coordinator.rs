//! Top-level handle wiring the registry, event bus, coordination manager and
//! scheduler together

use crate::agent::{Agent, AgentRegistry};
use crate::clock::{system_clock, SharedClock};
use crate::config::CoordinatorConfig;
use crate::coordination::{with_timeout, CoordinationManager};
use crate::error::{AgentError, Error, Result, TaskError};
use crate::events::EventBus;
use crate::jobs::JobGroup;
use crate::scheduler::{RecoveryProbe, SchedulerHooks, TaskScheduler};
use crate::storage::{SqliteStateStore, StateStore};
use crate::types::{Event, EventKind, PoolAgentSpec, RegisteredAgent, Task, TaskRequest};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Pool capacity given to enrolled agents that do not declare `maxLoad`
const ENROLLED_MAX_LOAD: u32 = 1;

pub struct Coordinator {
    config: CoordinatorConfig,
    bus: EventBus,
    store: Option<Arc<dyn StateStore>>,
    registry: Arc<AgentRegistry>,
    coordination: Arc<CoordinationManager>,
    scheduler: Arc<TaskScheduler>,
    jobs: JobGroup,
}

impl Coordinator {
    /// Build a coordinator from config, opening the SQLite store when
    /// storage is enabled. Must be called inside a tokio runtime.
    pub fn new(config: CoordinatorConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let store: Option<Arc<dyn StateStore>> = if config.storage.enabled {
            let dir = config.storage.resolved_data_dir();
            info!("Opening state store in {:?}", dir);
            Some(Arc::new(SqliteStateStore::open(dir)?))
        } else {
            None
        };
        Ok(Self::with_parts(config, store, system_clock(), None))
    }

    pub fn with_parts(
        config: CoordinatorConfig,
        store: Option<Arc<dyn StateStore>>,
        clock: SharedClock,
        recovery_probe: Option<Arc<dyn RecoveryProbe>>,
    ) -> Arc<Self> {
        let bus = EventBus::from_config(&config.coordination);
        let registry = AgentRegistry::new(config.registry.clone(), bus.clone(), Arc::clone(&clock));
        let coordination = CoordinationManager::new(
            config.coordination.clone(),
            Arc::clone(&registry),
            bus.clone(),
            store.clone(),
            Arc::clone(&clock),
        );
        let scheduler = TaskScheduler::with_hooks(
            config.scheduler.clone(),
            bus.clone(),
            clock,
            SchedulerHooks {
                store: store.clone(),
                recovery_probe,
            },
        );

        let coordinator = Arc::new(Self {
            config,
            bus,
            store,
            registry,
            coordination,
            scheduler,
            jobs: JobGroup::new("coordinator"),
        });

        if coordinator.config.auto_dispatch {
            coordinator.start_auto_dispatch();
        }
        info!(
            "Coordinator started (auto-dispatch: {}, storage: {})",
            coordinator.config.auto_dispatch,
            coordinator.store.is_some()
        );
        coordinator
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn coordination(&self) -> &Arc<CoordinationManager> {
        &self.coordination
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> Option<&Arc<dyn StateStore>> {
        self.store.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Register an agent with the registry and add it to the scheduler pool.
    ///
    /// `priority` and `maxLoad` are read from `metadata` when present. If the
    /// pool rejects the agent the registry entry is rolled back.
    pub async fn enroll(&self, agent: Arc<dyn Agent>, metadata: Value) -> Result<RegisteredAgent> {
        let id = agent.id().to_string();
        let max_load = metadata
            .get("maxLoad")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(ENROLLED_MAX_LOAD);
        let priority = metadata
            .get("priority")
            .and_then(Value::as_i64)
            .and_then(|n| i32::try_from(n).ok())
            .unwrap_or(0);

        let spec = PoolAgentSpec::new(id.clone(), agent.agent_type())
            .with_capabilities(agent.capabilities())
            .with_priority(priority)
            .with_max_load(max_load);

        let record = self.registry.register(agent, metadata)?;
        if let Err(e) = self.scheduler.register_agent(spec) {
            warn!("Pool rejected agent {}, rolling back registration: {}", id, e);
            if let Err(rollback) = self.registry.unregister(&id).await {
                warn!("Rollback of {} failed: {}", id, rollback);
            }
            return Err(e);
        }
        Ok(record)
    }

    /// Remove an agent from both the pool and the registry
    pub async fn dismiss(&self, agent_id: &str) -> Result<()> {
        let pooled = self.scheduler.unregister_agent(agent_id).is_ok();
        let registered = self.registry.unregister(agent_id).await.is_ok();
        if pooled || registered {
            Ok(())
        } else {
            Err(Error::Agent(AgentError::NotFound(agent_id.to_string())))
        }
    }

    /// Forward a heartbeat to every component that knows the agent
    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let registered = self.registry.heartbeat(agent_id).is_ok();
        let pooled = self.scheduler.heartbeat(agent_id).is_ok();
        if registered || pooled {
            Ok(())
        } else {
            Err(Error::Agent(AgentError::NotFound(agent_id.to_string())))
        }
    }

    pub fn submit_task(&self, request: TaskRequest) -> Task {
        self.scheduler.submit_task(request)
    }

    fn start_auto_dispatch(self: &Arc<Self>) {
        let mut events = self.bus.subscribe();
        let weak = Arc::downgrade(self);

        self.jobs.spawn_until_shutdown("auto-dispatch", async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind == EventKind::TaskAssigned => {
                        let Some(coordinator) = Weak::upgrade(&weak) else {
                            break;
                        };
                        coordinator.dispatch(&event);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Auto-dispatch fell behind, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Execute an assigned task on the matching registered agent and report
    /// the outcome. A timed-out execution keeps running detached; its late
    /// report is rejected by the scheduler.
    fn dispatch(&self, assigned: &Event) {
        let field = |name: &str| assigned.payload.get(name).and_then(Value::as_str);
        let (Some(task_id), Some(agent_id)) = (field("taskId"), field("agentId")) else {
            warn!("Malformed task:assigned event {}", assigned.id);
            return;
        };
        let Some(task) = self.scheduler.get_task(task_id) else {
            return;
        };
        let Some(agent) = self.registry.get(agent_id) else {
            debug!(
                "No registered agent {} for task {}, leaving it to the caller",
                agent_id, task_id
            );
            return;
        };

        let scheduler = Arc::clone(&self.scheduler);
        let timeout = self.config.coordination.task_timeout();
        let agent_id = agent_id.to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            let task_id = task.id.clone();
            let run = tokio::spawn(async move { agent.execute(&task).await });
            let outcome = with_timeout(&task_id, timeout, async move {
                run.await
                    .map_err(|e| Error::Internal(format!("execution aborted: {}", e)))?
            })
            .await;

            let report = match outcome {
                Ok(_) => scheduler.report_completion(&agent_id, &task_id, Some(started.elapsed())),
                Err(e) => scheduler.report_failure(&agent_id, &task_id, &e.to_string()),
            };
            match report {
                Ok(_) => {}
                Err(Error::Task(TaskError::NotAssigned(_))) => {
                    debug!("Ignoring late report for task {} from {}", task_id, agent_id);
                }
                Err(e) => warn!("Failed to report task {}: {}", task_id, e),
            }
        });
    }

    /// Stop every background job and close the bus
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.jobs.shutdown().await;
        self.scheduler.shutdown().await;
        self.coordination.shutdown().await;
        self.registry.shutdown().await;
        self.bus.shutdown().await;
    }
}
