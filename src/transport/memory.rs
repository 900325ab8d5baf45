//! In-process broker.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{topic_matches, Message, Transport, TransportError};

struct Subscription {
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Subscription {
    fn wants(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| topic_matches(f, topic))
    }
}

/// Messages kept for [`MemoryBroker::history`] unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

struct BrokerState {
    retained: BTreeMap<String, Message>,
    subscriptions: Vec<Subscription>,
    last_will: Option<Message>,
    connected: bool,
    history: VecDeque<Message>,
    history_limit: usize,
}

impl BrokerState {
    fn with_history_limit(history_limit: usize) -> Self {
        Self {
            retained: BTreeMap::new(),
            subscriptions: Vec::new(),
            last_will: None,
            connected: false,
            history: VecDeque::new(),
            history_limit,
        }
    }

    fn record(&mut self, message: Message) {
        if self.history_limit == 0 {
            return;
        }
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }
}

/// In-process publish/subscribe broker.
///
/// Every clone refers to the same broker, so the controller and a test acting as
/// supervisor can share one instance. Semantics follow MQTT where it matters:
///
/// - retained messages are replayed to new matching subscribers, and a retained
///   message with an empty payload clears the topic
/// - the last will registered at `connect` is published by
///   [`drop_connection`](Self::drop_connection), never by a graceful `disconnect`
///
/// The most recent routed messages are kept for inspection, up to
/// [`DEFAULT_HISTORY_LIMIT`] or the limit passed to
/// [`with_history_limit`](Self::with_history_limit).
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty broker keeping at most `limit` messages of history.
    ///
    /// A limit of zero disables history.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::with_history_limit(limit))),
        }
    }

    /// Route a message to subscribers and update retained state.
    pub fn send(&self, message: Message) {
        let mut state = self.state.lock();
        trace!(topic = %message.topic, retain = message.retain, "Broker message");

        if message.retain {
            if message.payload.is_empty() {
                state.retained.remove(&message.topic);
            } else {
                state.retained.insert(message.topic.clone(), message.clone());
            }
        }

        state
            .subscriptions
            .retain(|sub| !sub.wants(&message.topic) || sub.tx.send(message.clone()).is_ok());
        state.record(message);
    }

    /// Subscribe without going through the [`Transport`] trait.
    pub fn listen(&self, filters: &[&str]) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription {
            filters: filters.iter().map(|f| f.to_string()).collect(),
            tx,
        };

        let mut state = self.state.lock();
        for message in state.retained.values() {
            if subscription.wants(&message.topic) {
                let _ = subscription.tx.send(message.clone());
            }
        }
        state.subscriptions.push(subscription);
        rx
    }

    /// Simulate an unexpected loss of the client connection.
    ///
    /// Publishes the registered last will, if any.
    pub fn drop_connection(&self) {
        let will = {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.last_will.take()
        };

        if let Some(will) = will {
            debug!(topic = %will.topic, "Publishing last will");
            self.send(will);
        }
    }

    /// Last retained message on `topic`.
    pub fn retained(&self, topic: &str) -> Option<Message> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Retained history of routed messages, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Retained history on `topic`.
    pub fn history_for(&self, topic: &str) -> Vec<Message> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Whether a client session is open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, last_will: Message) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.last_will = Some(last_will);
        state.connected = true;
        Ok(())
    }

    async fn subscribe(
        &self,
        filters: &[String],
    ) -> Result<mpsc::UnboundedReceiver<Message>, TransportError> {
        let filters: Vec<&str> = filters.iter().map(String::as_str).collect();
        Ok(self.listen(&filters))
    }

    async fn publish(&self, message: Message) -> Result<(), TransportError> {
        self.send(message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connected = false;
        state.last_will = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_matching_topics_only() {
        let broker = MemoryBroker::new();
        let mut rx = broker.listen(&["scan/init", "scan/start"]);

        broker.send(Message::new("scan/init", "{}", false));
        broker.send(Message::new("scan/status", "{}", false));
        broker.send(Message::new("scan/start", "{}", false));

        assert_eq!(rx.recv().await.unwrap().topic, "scan/init");
        assert_eq!(rx.recv().await.unwrap().topic, "scan/start");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retained_replayed_to_late_subscriber() {
        let broker = MemoryBroker::new();
        broker.send(Message::new("scan/device", r#"{"device_available":true}"#, true));
        broker.send(Message::new("scan/device", r#"{"device_available":false}"#, true));

        let mut rx = broker.listen(&["scan/#"]);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload_str(), Some(r#"{"device_available":false}"#));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_retained_clears_topic() {
        let broker = MemoryBroker::new();
        broker.send(Message::new("scan/status", "x", true));
        broker.send(Message::new("scan/status", "", true));
        assert!(broker.retained("scan/status").is_none());
    }

    #[tokio::test]
    async fn test_last_will_only_on_unexpected_drop() {
        let broker = MemoryBroker::new();
        let will = Message::new("scan/status", r#"{"connected":false}"#, true);

        broker.connect(will.clone()).await.unwrap();
        broker.disconnect().await.unwrap();
        broker.drop_connection();
        assert!(broker.retained("scan/status").is_none());

        broker.connect(will.clone()).await.unwrap();
        broker.drop_connection();
        assert_eq!(broker.retained("scan/status"), Some(will));
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_history_keeps_most_recent_messages() {
        let broker = MemoryBroker::with_history_limit(3);
        let mut rx = broker.listen(&["scan/#"]);
        for i in 0..5 {
            broker.send(Message::new("scan/status", i.to_string(), false));
        }

        let kept: Vec<_> = broker
            .history()
            .iter()
            .map(|m| m.payload_str().unwrap().to_string())
            .collect();
        assert_eq!(kept, vec!["2", "3", "4"]);

        // Delivery is unaffected by the limit.
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().payload_str(), Some(i.to_string().as_str()));
        }
    }

    #[tokio::test]
    async fn test_zero_history_limit_records_nothing() {
        let broker = MemoryBroker::with_history_limit(0);
        broker.send(Message::new("scan/status", "x", true));
        assert!(broker.history().is_empty());
        assert!(broker.retained("scan/status").is_some());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let broker = MemoryBroker::new();
        let rx = broker.listen(&["scan/#"]);
        drop(rx);
        broker.send(Message::new("scan/status", "{}", false));
        assert!(broker.state.lock().subscriptions.is_empty());
    }
}
