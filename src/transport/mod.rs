//! Publish/subscribe transport abstraction.
//!
//! The controller speaks a topic-based protocol but does not implement a broker
//! client itself. It needs four things from a transport:
//!
//! - `connect` with a last-will message, published by the broker if the
//!   controller disappears without disconnecting
//! - `subscribe` to a set of topic filters, receiving matching messages on a channel
//! - `publish`, optionally retained
//! - `disconnect`, which discards the last will
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryBroker`] - in-process broker with retained messages, `+`/`#` filters and
//!   last-will support. Used by tests and for embedding.
//! - [`StdioTransport`] - line protocol (`<topic> <payload>`) on stdin/stdout for running
//!   the controller by hand or behind a bridge process.

pub mod memory;
pub mod stdio;

pub use memory::{MemoryBroker, DEFAULT_HISTORY_LIMIT};
pub use stdio::StdioTransport;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::ScanError;

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Used before `connect` or after `disconnect`
    #[error("not connected")]
    NotConnected,

    /// Transport cannot do what was asked
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for ScanError {
    fn from(err: TransportError) -> Self {
        ScanError::Transport(err.to_string())
    }
}

/// A message on the wire, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Full topic name
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Whether the broker keeps this as the topic's last value
    pub retain: bool,
}

impl Message {
    /// Create a message from raw bytes.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    /// Create a message with a JSON-encoded payload.
    pub fn json<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        value: &T,
        retain: bool,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(value)?, retain))
    }

    /// Payload as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// MQTT-style topic filter matching.
///
/// `+` matches exactly one level, a trailing `#` matches any remaining levels
/// (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Client side of a publish/subscribe broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the session, registering `last_will` with the broker.
    async fn connect(&self, last_will: Message) -> Result<(), TransportError>;

    /// Subscribe to `filters`; matching messages arrive on the returned channel.
    async fn subscribe(
        &self,
        filters: &[String],
    ) -> Result<mpsc::UnboundedReceiver<Message>, TransportError>;

    /// Publish one message.
    async fn publish(&self, message: Message) -> Result<(), TransportError>;

    /// Close the session gracefully. The last will is not published.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("scan/init", "scan/init"));
        assert!(!topic_matches("scan/init", "scan/start"));
        assert!(!topic_matches("scan/init", "scan/init/extra"));
        assert!(!topic_matches("scan/init/extra", "scan/init"));
    }

    #[test]
    fn test_topic_matches_wildcards() {
        assert!(topic_matches("scan/+", "scan/status"));
        assert!(!topic_matches("scan/+", "scan/a/b"));
        assert!(topic_matches("scan/#", "scan/a/b"));
        assert!(topic_matches("scan/#", "scan"));
        assert!(topic_matches("+/status", "lab/status"));
    }

    #[test]
    fn test_json_message() {
        let msg = Message::json("scan/status", &serde_json::json!({"running": true}), false)
            .unwrap();
        assert_eq!(msg.payload_str(), Some(r#"{"running":true}"#));
        assert!(!msg.retain);
    }
}
