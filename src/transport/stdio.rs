//! Line-oriented transport over stdin/stdout.
//!
//! Each line is `<topic> <payload>`; the payload is everything after the first
//! run of whitespace and may be empty. Retained messages are written with a
//! `retained ` prefix so a bridge process can forward them with the flag set.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{topic_matches, Message, Transport, TransportError};

/// Transport reading commands from stdin and writing publications to stdout.
#[derive(Default)]
pub struct StdioTransport {
    subscribed: AtomicBool,
    closed: AtomicBool,
    last_will: Mutex<Option<Message>>,
    stdout: tokio::sync::Mutex<Option<tokio::io::Stdout>>,
}

impl StdioTransport {
    /// Create the transport. Nothing is read until [`Transport::subscribe`].
    pub fn new() -> Self {
        Self::default()
    }

    async fn write_line(&self, line: String) -> Result<(), TransportError> {
        let mut guard = self.stdout.lock().await;
        let stdout = guard.get_or_insert_with(tokio::io::stdout);
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Split an input line into a message. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Message> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (topic, payload) = match line.split_once(char::is_whitespace) {
        Some((topic, rest)) => (topic, rest.trim_start()),
        None => (line, ""),
    };
    Some(Message::new(topic, payload, false))
}

/// Render an outbound message as one output line.
pub fn format_line(message: &Message) -> String {
    let payload = String::from_utf8_lossy(&message.payload);
    if message.retain {
        format!("retained {} {}", message.topic, payload)
    } else {
        format!("{} {}", message.topic, payload)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self, last_will: Message) -> Result<(), TransportError> {
        *self.last_will.lock() = Some(last_will);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        filters: &[String],
    ) -> Result<mpsc::UnboundedReceiver<Message>, TransportError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Unsupported(
                "stdin can only be subscribed once".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let filters = filters.to_vec();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(message) = parse_line(&line) else {
                            continue;
                        };
                        if !filters.iter().any(|f| topic_matches(f, &message.topic)) {
                            debug!(topic = %message.topic, "Ignoring unsubscribed topic");
                            continue;
                        }
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn publish(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.write_line(format_line(&message)).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.last_will.lock().take();
        if let Some(stdout) = self.stdout.lock().await.as_mut() {
            stdout.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_with_payload() {
        let msg = parse_line(r#"scan/init {"rate": 1000}"#).unwrap();
        assert_eq!(msg.topic, "scan/init");
        assert_eq!(msg.payload_str(), Some(r#"{"rate": 1000}"#));
    }

    #[test]
    fn test_parse_line_without_payload() {
        let msg = parse_line("  scan/start  ").unwrap();
        assert_eq!(msg.topic, "scan/start");
        assert!(msg.payload.is_empty());
        assert!(parse_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_publish_after_disconnect_fails() {
        let transport = StdioTransport::new();
        transport.disconnect().await.unwrap();
        let err = transport
            .publish(Message::new("scan/status", "{}", false))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn test_format_line_marks_retained() {
        let msg = Message::new("scan/device", r#"{"device_available":true}"#, true);
        assert_eq!(
            format_line(&msg),
            r#"retained scan/device {"device_available":true}"#
        );
        let msg = Message::new("scan/result", "[[1.0]]", false);
        assert_eq!(format_line(&msg), "scan/result [[1.0]]");
    }
}
