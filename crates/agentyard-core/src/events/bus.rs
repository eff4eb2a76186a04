//! Publish/subscribe event bus

use crate::agent::Agent;
use crate::config::CoordinationConfig;
use crate::types::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Buffer of the global topic before slow subscribers start lagging
pub const DEFAULT_GLOBAL_CAPACITY: usize = 1024;

const SESSION_SUBSCRIBER_CAPACITY: usize = 256;

enum TopicCommand {
    Deliver {
        event: Event,
        recipients: Vec<Arc<dyn Agent>>,
    },
    Flush(oneshot::Sender<()>),
}

struct SessionTopic {
    commands: mpsc::UnboundedSender<TopicCommand>,
    subscribers: broadcast::Sender<Event>,
    dispatcher: JoinHandle<()>,
}

struct BusInner {
    global: broadcast::Sender<Event>,
    topics: Mutex<HashMap<String, SessionTopic>>,
    delivery_slots: Arc<Semaphore>,
    delivery_timeout: Duration,
}

/// Event bus shared by all coordinator components
///
/// Publishing never waits on subscribers. Session deliveries run on a
/// bounded pool of delivery tasks; each delivery is raced against a timeout
/// and its failure is logged without affecting other recipients.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(delivery_workers: usize, delivery_timeout: Duration) -> Self {
        let (global, _) = broadcast::channel(DEFAULT_GLOBAL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                global,
                topics: Mutex::new(HashMap::new()),
                delivery_slots: Arc::new(Semaphore::new(delivery_workers.max(1))),
                delivery_timeout,
            }),
        }
    }

    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self::new(config.delivery_workers, config.delivery_timeout())
    }

    /// Publish on the global topic only
    pub fn publish(&self, event: Event) {
        trace!("Publishing {} from {}", event.kind, event.agent_id);
        if self.inner.global.send(event).is_err() {
            trace!("No global subscribers");
        }
    }

    /// Publish globally and queue delivery to a session's participants.
    ///
    /// Events without a session id only reach the global topic.
    pub fn publish_to_session(&self, event: Event, recipients: Vec<Arc<dyn Agent>>) {
        let Some(session_id) = event.session_id.clone() else {
            self.publish(event);
            return;
        };

        self.publish(event.clone());

        let mut topics = self.inner.topics.lock();
        let topic = topics
            .entry(session_id.clone())
            .or_insert_with(|| self.open_topic(&session_id));
        if topic
            .commands
            .send(TopicCommand::Deliver { event, recipients })
            .is_err()
        {
            warn!("Session topic {} is closed, dropping delivery", session_id);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.global.subscribe()
    }

    /// Receive a session's events in delivery order
    pub fn subscribe_session(&self, session_id: &str) -> broadcast::Receiver<Event> {
        let mut topics = self.inner.topics.lock();
        topics
            .entry(session_id.to_string())
            .or_insert_with(|| self.open_topic(session_id))
            .subscribers
            .subscribe()
    }

    /// Wait until every event queued for the session so far is delivered
    pub async fn flush_session(&self, session_id: &str) {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let topics = self.inner.topics.lock();
            let Some(topic) = topics.get(session_id) else {
                return;
            };
            if topic.commands.send(TopicCommand::Flush(ack_tx)).is_err() {
                return;
            }
        }
        let _ = ack_rx.await;
    }

    /// Stop accepting events for a session. Queued deliveries still run.
    pub fn close_session(&self, session_id: &str) {
        if self.inner.topics.lock().remove(session_id).is_some() {
            debug!("Closing session topic {}", session_id);
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.topics.lock().len()
    }

    /// Close every session topic and wait for pending deliveries
    pub async fn shutdown(&self) {
        let topics: Vec<(String, SessionTopic)> = self.inner.topics.lock().drain().collect();
        for (session_id, topic) in topics {
            drop(topic.commands);
            if let Err(e) = topic.dispatcher.await {
                error!("Dispatcher for session {} ended abnormally: {}", session_id, e);
            }
        }
    }

    fn open_topic(&self, session_id: &str) -> SessionTopic {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (subscribers, _) = broadcast::channel(SESSION_SUBSCRIBER_CAPACITY);
        debug!("Opening session topic {}", session_id);

        let dispatcher = tokio::spawn(run_dispatcher(
            session_id.to_string(),
            receiver,
            subscribers.clone(),
            Arc::clone(&self.inner.delivery_slots),
            self.inner.delivery_timeout,
        ));

        SessionTopic {
            commands,
            subscribers,
            dispatcher,
        }
    }
}

async fn run_dispatcher(
    session_id: String,
    mut commands: mpsc::UnboundedReceiver<TopicCommand>,
    subscribers: broadcast::Sender<Event>,
    slots: Arc<Semaphore>,
    timeout: Duration,
) {
    while let Some(command) = commands.recv().await {
        match command {
            TopicCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            TopicCommand::Deliver { event, recipients } => {
                let _ = subscribers.send(event.clone());
                deliver(&session_id, event, recipients, &slots, timeout).await;
            }
        }
    }
    debug!("Session topic {} drained", session_id);
}

/// Deliver one event to every recipient, finishing before the next event
/// of the session starts.
async fn deliver(
    session_id: &str,
    event: Event,
    recipients: Vec<Arc<dyn Agent>>,
    slots: &Arc<Semaphore>,
    timeout: Duration,
) {
    let event = Arc::new(event);
    let mut deliveries = Vec::with_capacity(recipients.len());

    for agent in recipients {
        let Ok(permit) = Arc::clone(slots).acquire_owned().await else {
            warn!("Delivery pool closed, dropping {} for session {}", event.kind, session_id);
            return;
        };
        let agent_id = agent.id().to_string();
        let event = Arc::clone(&event);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            tokio::time::timeout(timeout, agent.on_event(&event)).await
        });
        deliveries.push((agent_id, handle));
    }

    for (agent_id, handle) in deliveries {
        match handle.await {
            Ok(Ok(Ok(()))) => trace!("Delivered {} to {}", event.kind, agent_id),
            Ok(Ok(Err(e))) => warn!("Agent {} rejected {}: {}", agent_id, event.kind, e),
            Ok(Err(_)) => warn!(
                "Agent {} timed out handling {} after {:?}",
                agent_id, event.kind, timeout
            ),
            Err(e) => error!("Delivery of {} to {} aborted: {}", event.kind, agent_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{scripted_agent, ScriptedExecutor};
    use crate::types::EventKind;
    use serde_json::json;

    fn session_event(n: i64) -> Event {
        Event::system(EventKind::StateUpdated, json!({ "n": n })).in_session("s1")
    }

    #[tokio::test]
    async fn test_session_events_arrive_in_order() {
        let bus = EventBus::new(4, Duration::from_secs(1));
        let agent = scripted_agent("a1", "parse", ScriptedExecutor::succeeding());
        let recipient: Arc<dyn Agent> = agent.clone();

        for n in 0..10 {
            bus.publish_to_session(session_event(n), vec![Arc::clone(&recipient)]);
        }
        bus.flush_session("s1").await;

        let seen: Vec<i64> = agent
            .executor()
            .received
            .lock()
            .iter()
            .filter_map(|e| e.payload["n"].as_i64())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failing_recipient_does_not_block_others() {
        let bus = EventBus::new(4, Duration::from_millis(50));

        let broken = scripted_agent(
            "broken",
            "test",
            ScriptedExecutor {
                fail_events: true,
                ..ScriptedExecutor::default()
            },
        );
        let slow = scripted_agent(
            "slow",
            "test",
            ScriptedExecutor {
                event_delay: Duration::from_secs(5),
                ..ScriptedExecutor::default()
            },
        );
        let healthy = scripted_agent("healthy", "test", ScriptedExecutor::succeeding());

        let recipients: Vec<Arc<dyn Agent>> = vec![broken.clone(), slow.clone(), healthy.clone()];
        bus.publish_to_session(session_event(1), recipients);
        bus.flush_session("s1").await;

        assert_eq!(healthy.executor().received.lock().len(), 1);
        assert_eq!(broken.executor().received.lock().len(), 1);
        assert!(slow.executor().received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_global_and_session_subscribers() {
        let bus = EventBus::new(1, Duration::from_secs(1));
        let mut global = bus.subscribe();
        let mut session = bus.subscribe_session("s1");

        bus.publish(Event::system(EventKind::AgentRegistered, json!({})));
        bus.publish_to_session(session_event(7), Vec::new());
        bus.flush_session("s1").await;

        assert_eq!(global.recv().await.unwrap().kind, EventKind::AgentRegistered);
        assert_eq!(global.recv().await.unwrap().payload["n"], 7);
        assert_eq!(session.recv().await.unwrap().payload["n"], 7);
    }

    #[tokio::test]
    async fn test_close_session_drains_then_stops() {
        let bus = EventBus::new(2, Duration::from_secs(1));
        let agent = scripted_agent("a1", "scm", ScriptedExecutor::succeeding());
        let mut session = bus.subscribe_session("s1");

        bus.publish_to_session(session_event(1), vec![agent.clone() as Arc<dyn Agent>]);
        bus.close_session("s1");
        assert_eq!(bus.open_sessions(), 0);

        assert_eq!(session.recv().await.unwrap().payload["n"], 1);
        assert!(matches!(
            session.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(agent.executor().received.lock().len(), 1);
    }
}
