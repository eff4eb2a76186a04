//! Registry of live agent instances
//!
//! Agents are keyed by id and indexed by type in registration order. The
//! registry owns two background jobs: a heartbeat monitor that flips silent
//! agents inactive, and a cleanup job that removes agents which stayed silent
//! for twice the stale timeout.

use super::Agent;
use crate::clock::SharedClock;
use crate::config::RegistryConfig;
use crate::error::{AgentError, Error, Result};
use crate::events::EventBus;
use crate::jobs::JobGroup;
use crate::types::{AgentType, Event, EventKind, RegisteredAgent, RegistrationStatus, RuntimeState};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Entry {
    agent: Arc<dyn Agent>,
    record: RegisteredAgent,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Entry>,
    /// Registration order
    order: Vec<String>,
    by_type: HashMap<AgentType, Vec<String>>,
}

impl RegistryState {
    fn remove(&mut self, id: &str) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|other| other != id);
        if let Some(ids) = self.by_type.get_mut(&entry.record.agent_type) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_type.remove(&entry.record.agent_type);
            }
        }
        Some(entry)
    }
}

/// Catalog of registered agents
pub struct AgentRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    bus: EventBus,
    clock: SharedClock,
    jobs: JobGroup,
}

impl AgentRegistry {
    /// Create the registry and start its heartbeat and cleanup jobs
    pub fn new(config: RegistryConfig, bus: EventBus, clock: SharedClock) -> Arc<Self> {
        let registry = Arc::new(Self {
            config,
            state: RwLock::new(RegistryState::default()),
            bus,
            clock,
            jobs: JobGroup::new("agent-registry"),
        });

        let weak = Arc::downgrade(&registry);
        registry.jobs.spawn_periodic(
            "heartbeat-monitor",
            registry.config.heartbeat_interval(),
            move || {
                let weak: Weak<Self> = weak.clone();
                async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.check_stale();
                    }
                    Ok(())
                }
            },
        );

        let weak = Arc::downgrade(&registry);
        registry.jobs.spawn_periodic(
            "stale-cleanup",
            registry.config.cleanup_interval(),
            move || {
                let weak: Weak<Self> = weak.clone();
                async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.cleanup_inactive().await;
                    }
                    Ok(())
                }
            },
        );

        registry
    }

    /// Register an agent instance.
    ///
    /// `metadata` must be an object with string `name` and `version` fields
    /// and optionally a `tags` array of strings.
    pub fn register(&self, agent: Arc<dyn Agent>, metadata: Value) -> Result<RegisteredAgent> {
        let id = agent.id().to_string();
        let now = self.clock.now();

        let record = {
            let mut state = self.state.write();
            if state.entries.contains_key(&id) {
                return Err(Error::Agent(AgentError::Duplicate(id)));
            }
            if state.entries.len() >= self.config.max_agents {
                return Err(Error::Agent(AgentError::CapacityExceeded {
                    max: self.config.max_agents,
                }));
            }
            let fields = RequiredMetadata::parse(&id, metadata)?;

            let record = RegisteredAgent {
                id: id.clone(),
                agent_type: agent.agent_type(),
                capabilities: agent.capabilities(),
                name: fields.name,
                version: fields.version,
                tags: fields.tags,
                metadata: fields.rest,
                status: RegistrationStatus::Active,
                registered_at: now,
                last_heartbeat: now,
                inactive_since: None,
            };

            let forwarder = spawn_forwarder(&id, agent.subscribe(), self.bus.clone());
            state
                .by_type
                .entry(record.agent_type.clone())
                .or_default()
                .push(id.clone());
            state.order.push(id.clone());
            state.entries.insert(
                id.clone(),
                Entry {
                    agent,
                    record: record.clone(),
                    forwarder,
                },
            );
            record
        };

        info!("Registered agent: {} ({})", record.name, id);
        self.bus.publish(Event::system(
            EventKind::AgentRegistered,
            json!({
                "agentId": id,
                "agentType": record.agent_type.as_str(),
                "capabilities": record.capabilities,
            }),
        ));
        Ok(record)
    }

    /// Remove an agent, stopping it on a best-effort basis
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let entry = self
            .state
            .write()
            .remove(id)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(id.to_string())))?;

        self.retire(entry, "unregistered").await;
        Ok(())
    }

    async fn retire(&self, entry: Entry, reason: &str) {
        entry.forwarder.abort();
        if let Err(e) = entry.agent.stop().await {
            warn!("Failed to stop agent {} during removal: {}", entry.record.id, e);
        }
        info!("Removed agent: {} ({})", entry.record.id, reason);
        self.bus.publish(Event::system(
            EventKind::AgentUnregistered,
            json!({ "agentId": entry.record.id, "reason": reason }),
        ));
    }

    /// Record a heartbeat, reactivating an inactive agent
    pub fn heartbeat(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.write();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(id.to_string())))?;

        entry.record.last_heartbeat = now;
        if entry.record.status == RegistrationStatus::Inactive {
            entry.record.status = RegistrationStatus::Active;
            entry.record.inactive_since = None;
            info!("Agent {} is active again", id);
        }
        Ok(())
    }

    /// Up to `count` idle, active agents of a type in registration order
    pub fn find_available_agents(&self, agent_type: &AgentType, count: usize) -> Vec<Arc<dyn Agent>> {
        let state = self.state.read();
        let Some(ids) = state.by_type.get(agent_type) else {
            return Vec::new();
        };

        ids.iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| entry.record.status == RegistrationStatus::Active)
            .filter(|entry| entry.agent.state() == RuntimeState::Idle)
            .take(count)
            .map(|entry| Arc::clone(&entry.agent))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.state
            .read()
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.agent))
    }

    pub fn record(&self, id: &str) -> Option<RegisteredAgent> {
        self.state
            .read()
            .entries
            .get(id)
            .map(|entry| entry.record.clone())
    }

    /// All registrations in registration order
    pub fn list(&self) -> Vec<RegisteredAgent> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flip agents silent for longer than the stale timeout to inactive.
    ///
    /// Returns how many agents went inactive on this pass.
    pub fn check_stale(&self) -> usize {
        let now = self.clock.now();
        let stale_after = chrono_duration(self.config.stale_timeout());

        let stale: Vec<String> = {
            let mut state = self.state.write();
            let RegistryState { entries, order, .. } = &mut *state;
            let mut stale = Vec::new();
            for id in order.iter() {
                let Some(entry) = entries.get_mut(id) else {
                    continue;
                };
                if entry.record.status == RegistrationStatus::Active
                    && now - entry.record.last_heartbeat > stale_after
                {
                    entry.record.status = RegistrationStatus::Inactive;
                    entry.record.inactive_since = Some(now);
                    stale.push(id.clone());
                }
            }
            stale
        };

        if !stale.is_empty() {
            warn!("Detected {} stale agent(s): {:?}", stale.len(), stale);
            self.bus.publish(Event::system(
                EventKind::StaleAgentsDetected,
                json!({ "count": stale.len(), "agentIds": stale }),
            ));
        }
        stale.len()
    }

    /// Remove inactive agents silent for more than twice the stale timeout
    pub async fn cleanup_inactive(&self) -> Vec<String> {
        let now = self.clock.now();
        let expire_after = chrono_duration(self.config.stale_timeout() * 2);

        let removed: Vec<Entry> = {
            let mut state = self.state.write();
            let expired: Vec<String> = state
                .order
                .iter()
                .filter(|id| {
                    state.entries.get(*id).is_some_and(|entry| {
                        entry.record.status == RegistrationStatus::Inactive
                            && now - entry.record.last_heartbeat > expire_after
                    })
                })
                .cloned()
                .collect();
            expired.iter().filter_map(|id| state.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(removed.len());
        for entry in removed {
            ids.push(entry.record.id.clone());
            self.retire(entry, "stale").await;
        }
        if !ids.is_empty() {
            info!("Cleaned up {} inactive agent(s)", ids.len());
        }
        ids
    }

    /// Stop background jobs and event forwarding
    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
        for entry in self.state.read().entries.values() {
            entry.forwarder.abort();
        }
    }
}

fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

struct RequiredMetadata {
    name: String,
    version: String,
    tags: Vec<String>,
    rest: serde_json::Map<String, Value>,
}

impl RequiredMetadata {
    fn parse(id: &str, metadata: Value) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::Agent(AgentError::Validation(format!("{}: {}", id, reason)))
        };

        let Value::Object(mut rest) = metadata else {
            return Err(invalid("metadata must be an object"));
        };

        let name = match rest.remove("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name,
            Some(_) => return Err(invalid("metadata.name must be a non-empty string")),
            None => return Err(invalid("metadata.name is required")),
        };
        let version = match rest.remove("version") {
            Some(Value::String(version)) => version,
            Some(_) => return Err(invalid("metadata.version must be a string")),
            None => return Err(invalid("metadata.version is required")),
        };
        let tags = match rest.remove("tags") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(tag) => Ok(tag),
                    _ => Err(invalid("metadata.tags must contain only strings")),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(invalid("metadata.tags must be an array")),
        };

        Ok(Self {
            name,
            version,
            tags,
            rest,
        })
    }
}

/// Relay an agent's own events onto the bus until the agent is dropped or
/// the registry aborts the relay.
fn spawn_forwarder(
    agent_id: &str,
    mut events: broadcast::Receiver<Event>,
    bus: EventBus,
) -> JoinHandle<()> {
    let agent_id = agent_id.to_string();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => bus.publish(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    error!("Dropped {} event(s) from agent {}", skipped, agent_id);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Stopped forwarding events for agent {}", agent_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{scripted_agent, ScriptedExecutor};
    use crate::clock::ManualClock;
    use crate::types::Task;
    use std::time::Duration;

    fn metadata(name: &str) -> Value {
        json!({ "name": name, "version": "1.0.0", "tags": ["core"], "team": "infra" })
    }

    fn registry_with(config: RegistryConfig) -> (Arc<AgentRegistry>, EventBus, ManualClock) {
        let bus = EventBus::new(4, Duration::from_secs(1));
        let clock = ManualClock::default();
        let registry = AgentRegistry::new(config, bus.clone(), Arc::new(clock.clone()));
        (registry, bus, clock)
    }

    fn registry() -> (Arc<AgentRegistry>, EventBus, ManualClock) {
        registry_with(RegistryConfig::default())
    }

    #[tokio::test]
    async fn test_register_indexes_and_announces() {
        let (registry, bus, _) = registry();
        let mut events = bus.subscribe();

        let record = registry
            .register(scripted_agent("p1", "parse", ScriptedExecutor::succeeding()), metadata("Parser"))
            .unwrap();

        assert_eq!(record.name, "Parser");
        assert_eq!(record.tags, vec!["core"]);
        assert_eq!(record.metadata["team"], "infra");
        assert_eq!(registry.len(), 1);

        let announced = events.recv().await.unwrap();
        assert_eq!(announced.kind, EventKind::AgentRegistered);
        assert_eq!(announced.payload["agentId"], "p1");
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_capacity_and_bad_metadata() {
        let config = RegistryConfig {
            max_agents: 1,
            ..RegistryConfig::default()
        };
        let (registry, _, _) = registry_with(config);
        registry
            .register(scripted_agent("a", "test", ScriptedExecutor::succeeding()), metadata("A"))
            .unwrap();

        let dup = registry.register(
            scripted_agent("a", "test", ScriptedExecutor::succeeding()),
            metadata("A"),
        );
        assert!(matches!(dup, Err(Error::Agent(AgentError::Duplicate(_)))));

        let full = registry.register(
            scripted_agent("b", "test", ScriptedExecutor::succeeding()),
            metadata("B"),
        );
        assert!(matches!(
            full,
            Err(Error::Agent(AgentError::CapacityExceeded { max: 1 }))
        ));

        let (registry, _, _) = registry_with(RegistryConfig::default());
        for bad in [
            json!("not an object"),
            json!({ "version": "1" }),
            json!({ "name": "x", "version": 3 }),
            json!({ "name": "x", "version": "1", "tags": [1] }),
        ] {
            let result =
                registry.register(scripted_agent("c", "scm", ScriptedExecutor::succeeding()), bad);
            assert!(matches!(result, Err(Error::Agent(AgentError::Validation(_)))));
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_stops_agent_and_updates_index() {
        let (registry, bus, _) = registry();
        let agent = scripted_agent("p1", "parse", ScriptedExecutor::succeeding());
        registry.register(agent.clone(), metadata("Parser")).unwrap();
        let mut events = bus.subscribe();

        registry.unregister("p1").await.unwrap();
        assert!(registry.get("p1").is_none());
        assert!(registry.find_available_agents(&AgentType::Parse, 5).is_empty());
        assert_eq!(events.recv().await.unwrap().kind, EventKind::AgentUnregistered);

        let missing = registry.unregister("p1").await;
        assert!(matches!(missing, Err(Error::Agent(AgentError::NotFound(_)))));
    }

    #[tokio::test]
    async fn test_find_available_agents_skips_busy_and_keeps_order() {
        let (registry, _, _) = registry();
        let slow = scripted_agent("t1", "test", ScriptedExecutor::slow(Duration::from_millis(200)));
        for agent in [
            slow.clone(),
            scripted_agent("t2", "test", ScriptedExecutor::succeeding()),
            scripted_agent("t3", "test", ScriptedExecutor::succeeding()),
        ] {
            let id = agent.id().to_string();
            registry.register(agent, metadata(&id)).unwrap();
        }

        let running = slow.clone();
        let handle = tokio::spawn(async move { running.execute(&Task::new("test", "s1")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ids: Vec<String> = registry
            .find_available_agents(&AgentType::Test, 2)
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        assert_eq!(ids, vec!["t2", "t3"]);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_agents_go_inactive_then_get_cleaned_up() {
        let (registry, bus, clock) = registry();
        registry
            .register(scripted_agent("a", "scm", ScriptedExecutor::succeeding()), metadata("A"))
            .unwrap();
        registry
            .register(scripted_agent("b", "scm", ScriptedExecutor::succeeding()), metadata("B"))
            .unwrap();
        let mut events = bus.subscribe();

        clock.advance(Duration::from_secs(100));
        registry.heartbeat("b").unwrap();
        clock.advance(Duration::from_secs(21));

        assert_eq!(registry.check_stale(), 1);
        let detected = events.recv().await.unwrap();
        assert_eq!(detected.kind, EventKind::StaleAgentsDetected);
        assert_eq!(detected.payload["count"], 1);
        assert_eq!(registry.record("a").unwrap().status, RegistrationStatus::Inactive);
        assert!(registry.find_available_agents(&AgentType::Scm, 5).len() == 1);

        // not yet past twice the stale timeout
        assert!(registry.cleanup_inactive().await.is_empty());

        clock.advance(Duration::from_secs(120));
        registry.heartbeat("b").unwrap();
        assert_eq!(registry.cleanup_inactive().await, vec!["a".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reactivates_inactive_agent() {
        let (registry, _, clock) = registry();
        registry
            .register(scripted_agent("a", "analysis", ScriptedExecutor::succeeding()), metadata("A"))
            .unwrap();

        clock.advance(Duration::from_secs(121));
        registry.check_stale();
        registry.heartbeat("a").unwrap();

        let record = registry.record("a").unwrap();
        assert_eq!(record.status, RegistrationStatus::Active);
        assert!(record.inactive_since.is_none());
    }

    #[tokio::test]
    async fn test_agent_events_are_forwarded_to_bus() {
        let (registry, bus, _) = registry();
        let agent = scripted_agent("p1", "parse", ScriptedExecutor::succeeding());
        registry.register(agent.clone(), metadata("Parser")).unwrap();
        let mut events = bus.subscribe();

        agent.execute(&Task::new("parse", "s1")).await.unwrap();

        let started = events.recv().await.unwrap();
        assert_eq!(started.kind, EventKind::TaskStarted);
        assert_eq!(started.agent_id, "p1");
        assert_eq!(events.recv().await.unwrap().kind, EventKind::TaskCompleted);
    }

    #[tokio::test]
    async fn test_forwarding_survives_agent_restart() {
        let (registry, bus, _) = registry();
        let agent = scripted_agent("p1", "parse", ScriptedExecutor::succeeding());
        registry.register(agent.clone(), metadata("Parser")).unwrap();
        let mut events = bus.subscribe();

        agent.stop().await.unwrap();
        agent.initialize().await.unwrap();
        agent.execute(&Task::new("parse", "s1")).await.unwrap();

        let started = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.kind, EventKind::TaskStarted);
        assert_eq!(started.agent_id, "p1");
    }
}
