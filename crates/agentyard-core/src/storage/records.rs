//! JSON records stored through a [`StateStore`]

use super::StateStore;
use crate::error::Result;
use crate::types::{CoordinationContext, Event, PoolAgent};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

const CONTEXT_FIELD: &str = "context";
const RECORD_FIELD: &str = "record";

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn session_events_key(session_id: &str) -> String {
    format!("session:{}:events", session_id)
}

pub fn pool_agent_key(agent_id: &str) -> String {
    format!("pool-agent:{}", agent_id)
}

/// Session fields without the event buffer, which is stored separately
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSnapshot<'a> {
    session_id: &'a str,
    initiator_id: &'a str,
    participants: &'a [String],
    shared_state: &'a HashMap<String, serde_json::Value>,
    ttl_ms: u64,
    created_at: chrono::DateTime<chrono::Utc>,
    first_event_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Persist a session. The stored record expires when the in-memory session
/// would, so repeated saves never extend its lifetime.
pub fn save_session(
    store: &dyn StateStore,
    context: &CoordinationContext,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let snapshot = SessionSnapshot {
        session_id: &context.session_id,
        initiator_id: &context.initiator_id,
        participants: &context.participants,
        shared_state: &context.shared_state,
        ttl_ms: context.ttl_ms,
        created_at: context.created_at,
        first_event_at: context.first_event_at,
    };
    let key = session_key(&context.session_id);
    store.set_fields(
        &key,
        &[(CONTEXT_FIELD.to_string(), serde_json::to_string(&snapshot)?)],
    )?;
    store.expire(&key, context.remaining_ttl(now))
}

/// Append a session event. Events without a session are ignored.
pub fn append_session_event(store: &dyn StateStore, event: &Event, ttl: Duration) -> Result<()> {
    let Some(session_id) = event.session_id.as_deref() else {
        return Ok(());
    };
    let key = session_events_key(session_id);
    store.append_ordered(
        &key,
        event.timestamp.timestamp_millis(),
        &serde_json::to_string(event)?,
    )?;
    store.expire(&key, ttl)
}

/// Rebuild a session with at most `max_events` of its newest events
pub fn load_session(
    store: &dyn StateStore,
    session_id: &str,
    max_events: usize,
) -> Result<Option<CoordinationContext>> {
    let fields = store.get_fields(&session_key(session_id))?;
    let Some(raw) = fields.get(CONTEXT_FIELD) else {
        return Ok(None);
    };

    let mut context: CoordinationContext = serde_json::from_str(raw)?;
    let first_event_at = context.first_event_at;
    for (_, payload) in store.range_query(&session_events_key(session_id), i64::MIN, i64::MAX)? {
        let event: Event = serde_json::from_str(&payload)?;
        context.record_event(event, max_events);
    }
    if first_event_at.is_some() {
        context.first_event_at = first_event_at;
    }
    Ok(Some(context))
}

pub fn delete_session(store: &dyn StateStore, session_id: &str) -> Result<()> {
    store.delete(&session_key(session_id))?;
    store.delete(&session_events_key(session_id))
}

pub fn save_pool_agent(store: &dyn StateStore, agent: &PoolAgent) -> Result<()> {
    store.set_fields(
        &pool_agent_key(&agent.id),
        &[(RECORD_FIELD.to_string(), serde_json::to_string(agent)?)],
    )
}

pub fn load_pool_agent(store: &dyn StateStore, agent_id: &str) -> Result<Option<PoolAgent>> {
    let fields = store.get_fields(&pool_agent_key(agent_id))?;
    fields
        .get(RECORD_FIELD)
        .map(|raw| serde_json::from_str(raw).map_err(Into::into))
        .transpose()
}

pub fn delete_pool_agent(store: &dyn StateStore, agent_id: &str) -> Result<()> {
    store.delete(&pool_agent_key(agent_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MockStateStore, SqliteStateStore};
    use crate::types::{EventKind, PoolAgentSpec};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn session() -> CoordinationContext {
        let mut shared = HashMap::new();
        shared.insert("phase".to_string(), json!("index"));
        CoordinationContext::new(
            "s1",
            "lead",
            vec!["worker".to_string()],
            shared,
            Duration::from_secs(600),
        )
    }

    #[test]
    fn test_session_with_events_restores() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut context = session();

        for n in 0..4 {
            let event = Event::new(EventKind::StateUpdated, "lead", json!({ "n": n })).in_session("s1");
            context.record_event(event.clone(), 10);
            append_session_event(&store, &event, context.ttl()).unwrap();
        }
        save_session(&store, &context, chrono::Utc::now()).unwrap();

        let restored = load_session(&store, "s1", 3).unwrap().unwrap();
        assert_eq!(restored.participants, vec!["lead", "worker"]);
        assert_eq!(restored.shared_state["phase"], "index");
        assert_eq!(restored.events.len(), 3);
        assert_eq!(restored.events.back().unwrap().payload["n"], 3);
        assert_eq!(restored.first_event_at, context.first_event_at);

        delete_session(&store, "s1").unwrap();
        assert!(load_session(&store, "s1", 3).unwrap().is_none());
    }

    #[test]
    fn test_resave_keeps_original_expiry() {
        let mut context = session();
        let start = chrono::Utc::now();
        let mut event = Event::new(EventKind::StateUpdated, "lead", json!({})).in_session("s1");
        event.timestamp = start;
        context.record_event(event, 10);

        let mut store = MockStateStore::new();
        store.expect_set_fields().times(1).returning(|_, _| Ok(()));
        store
            .expect_expire()
            .withf(|key, ttl| key == "session:s1" && *ttl == Duration::from_secs(60))
            .times(1)
            .returning(|_, _| Ok(()));

        save_session(&store, &context, start + chrono::Duration::seconds(540)).unwrap();
    }

    #[test]
    fn test_exhausted_session_is_not_restored() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut context = session();
        let mut event = Event::new(EventKind::StateUpdated, "lead", json!({})).in_session("s1");
        event.timestamp = chrono::Utc::now() - chrono::Duration::seconds(900);
        context.record_event(event, 10);

        save_session(&store, &context, chrono::Utc::now()).unwrap();
        assert!(load_session(&store, "s1", 10).unwrap().is_none());
    }

    #[test]
    fn test_pool_agent_round_trip() {
        let store = SqliteStateStore::in_memory().unwrap();
        let agent = PoolAgent::from_spec(
            PoolAgentSpec::new("a1", "scm").with_capabilities(["git"]),
            chrono::Utc::now(),
        );

        save_pool_agent(&store, &agent).unwrap();
        let loaded = load_pool_agent(&store, "a1").unwrap().unwrap();
        assert_eq!(loaded.capabilities, agent.capabilities);

        delete_pool_agent(&store, "a1").unwrap();
        assert!(load_pool_agent(&store, "a1").unwrap().is_none());
    }
}
