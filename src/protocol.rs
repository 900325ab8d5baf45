//! Control/status protocol.
//!
//! All topics hang off a configurable base (default `scan`):
//!
//! | Topic            | Direction     | Payload                                   |
//! |------------------|---------------|-------------------------------------------|
//! | `{base}/init`    | in            | `{rate, dac_waveforms, adc_channels}`     |
//! | `{base}/start`   | in            | `{}`                                      |
//! | `{base}/abort`   | in            | `{}`                                      |
//! | `{base}/status`  | out, retained | `{connected}` / `{running}`               |
//! | `{base}/device`  | out, retained | `{device_available}`                      |
//! | `{base}/result`  | out           | `[[v, ...per channel], ...per point]`     |
//! | `{base}/error`   | out           | `{error}`                                 |

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};
use crate::transport::{Message, Transport};

/// Topic names derived from the base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    /// Topics rooted at `base`.
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Base topic.
    pub fn base(&self) -> &str {
        &self.base
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.base, leaf)
    }

    /// Inbound `init` command.
    pub fn init(&self) -> String {
        self.topic("init")
    }

    /// Inbound `start` command.
    pub fn start(&self) -> String {
        self.topic("start")
    }

    /// Inbound `abort` command.
    pub fn abort(&self) -> String {
        self.topic("abort")
    }

    /// Retained connection and run status.
    pub fn status(&self) -> String {
        self.topic("status")
    }

    /// Retained device availability heartbeat.
    pub fn device(&self) -> String {
        self.topic("device")
    }

    /// Captured rows of a completed scan.
    pub fn result(&self) -> String {
        self.topic("result")
    }

    /// Error reports.
    pub fn error(&self) -> String {
        self.topic("error")
    }

    /// Filters the controller subscribes to.
    pub fn command_filters(&self) -> Vec<String> {
        vec![self.init(), self.start(), self.abort()]
    }

    /// Which command, if any, `topic` carries.
    pub fn command_kind(&self, topic: &str) -> Option<CommandKind> {
        let leaf = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        match leaf {
            "init" => Some(CommandKind::Init),
            "start" => Some(CommandKind::Start),
            "abort" => Some(CommandKind::Abort),
            _ => None,
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("scan")
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// `{base}/status` on (dis)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Controller is attached to the broker
    pub connected: bool,
}

/// `{base}/status` during and after a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningStatus {
    /// A scan is armed or acquiring
    pub running: bool,
}

/// `{base}/device` heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Last availability probe succeeded
    pub device_available: bool,
}

/// `{base}/error` report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// `"<Context> error: <detail>"` or a decode failure
    pub error: String,
}

// =============================================================================
// Commands
// =============================================================================

/// Inbound command type, used as error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CommandKind {
    Init,
    Start,
    Abort,
}

impl CommandKind {
    /// Prefix used in error reports for failures of this command.
    pub fn error_context(&self) -> &'static str {
        match self {
            CommandKind::Init => "Initialization",
            CommandKind::Start => "Start",
            CommandKind::Abort => "Abort",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Init => write!(f, "init"),
            CommandKind::Start => write!(f, "start"),
            CommandKind::Abort => write!(f, "abort"),
        }
    }
}

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Raw init payload; validated by the controller
    Init(Value),
    /// Arm and trigger the initialized session
    Start,
    /// Stop whatever is running
    Abort,
}

impl Command {
    /// Kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Init(_) => CommandKind::Init,
            Command::Start => CommandKind::Start,
            Command::Abort => CommandKind::Abort,
        }
    }
}

/// Decode an inbound message.
///
/// Returns `Ok(None)` for topics that carry no command. Every command payload must
/// be valid UTF-8 JSON, including `start` and `abort`.
pub fn decode_command(topics: &Topics, message: &Message) -> ScanResult<Option<Command>> {
    let Some(kind) = topics.command_kind(&message.topic) else {
        return Ok(None);
    };

    let text = message
        .payload_str()
        .ok_or_else(|| ScanError::Protocol("Invalid JSON: payload is not UTF-8".to_string()))?;
    let payload: Value = serde_json::from_str(text)?;

    Ok(Some(match kind {
        CommandKind::Init => Command::Init(payload),
        CommandKind::Start => Command::Start,
        CommandKind::Abort => Command::Abort,
    }))
}

// =============================================================================
// Publisher
// =============================================================================

/// Typed publishing of every outbound message.
///
/// Publish failures are logged and swallowed: the controller has no other channel
/// to report them on.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    topics: Arc<Topics>,
}

impl Publisher {
    /// Publisher writing to `transport` under `topics`.
    pub fn new(transport: Arc<dyn Transport>, topics: Topics) -> Self {
        Self {
            transport,
            topics: Arc::new(topics),
        }
    }

    /// Topic names in use.
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    async fn send<T: Serialize + ?Sized>(&self, topic: String, value: &T, retain: bool) {
        let message = match Message::json(topic, value, retain) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to encode outbound payload");
                return;
            }
        };
        debug!(topic = %message.topic, retain, "Publishing");
        if let Err(e) = self.transport.publish(message).await {
            warn!(error = %e, "Publish failed");
        }
    }

    /// The `{connected}` status message, for registering as last will.
    pub fn connection_message(&self, connected: bool) -> ScanResult<Message> {
        Message::json(self.topics.status(), &ConnectionStatus { connected }, true)
            .map_err(|e| ScanError::Protocol(e.to_string()))
    }

    /// Retained `{connected}` status.
    pub async fn connected(&self, connected: bool) {
        self.send(self.topics.status(), &ConnectionStatus { connected }, true)
            .await;
    }

    /// `{running}` status.
    pub async fn running(&self, running: bool) {
        self.send(self.topics.status(), &RunningStatus { running }, false)
            .await;
    }

    /// Retained `{device_available}` heartbeat.
    pub async fn device_available(&self, device_available: bool) {
        self.send(self.topics.device(), &DeviceStatus { device_available }, true)
            .await;
    }

    /// Captured result matrix, rows are points.
    pub async fn result(&self, rows: &[Vec<f64>]) {
        self.send(self.topics.result(), rows, false).await;
    }

    /// `{error}` report with a context prefix, e.g. `"Start error: ..."`.
    pub async fn error(&self, context: &str, err: &(dyn fmt::Display + Sync)) {
        self.report(format!("{} error: {}", context, err)).await;
    }

    /// `{error}` report with a preformatted message.
    pub async fn report(&self, error: String) {
        warn!(%error, "Reporting error");
        self.send(self.topics.error(), &ErrorReport { error }, false)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_follow_base() {
        let topics = Topics::new("lab/scan");
        assert_eq!(topics.init(), "lab/scan/init");
        assert_eq!(topics.device(), "lab/scan/device");
        assert_eq!(
            topics.command_filters(),
            vec!["lab/scan/init", "lab/scan/start", "lab/scan/abort"]
        );
    }

    #[test]
    fn test_command_kind() {
        let topics = Topics::default();
        assert_eq!(topics.command_kind("scan/init"), Some(CommandKind::Init));
        assert_eq!(topics.command_kind("scan/abort"), Some(CommandKind::Abort));
        assert_eq!(topics.command_kind("scan/status"), None);
        assert_eq!(topics.command_kind("scanner/init"), None);
        assert_eq!(topics.command_kind("other/init"), None);
    }

    #[test]
    fn test_decode_start_requires_json() {
        let topics = Topics::default();
        let ok = decode_command(&topics, &Message::new("scan/start", "{}", false)).unwrap();
        assert_eq!(ok, Some(Command::Start));

        let err = decode_command(&topics, &Message::new("scan/start", "not json", false))
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON"));
    }

    #[test]
    fn test_decode_init_keeps_payload() {
        let topics = Topics::default();
        let msg = Message::new("scan/init", r#"{"rate": 5}"#, false);
        match decode_command(&topics, &msg).unwrap() {
            Some(Command::Init(value)) => assert_eq!(value["rate"], 5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_non_utf8() {
        let topics = Topics::default();
        let msg = Message::new("scan/init", vec![0xff, 0xfe], false);
        assert!(matches!(
            decode_command(&topics, &msg),
            Err(ScanError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_topic_is_ignored() {
        let topics = Topics::default();
        let msg = Message::new("scan/result", "garbage", false);
        assert_eq!(decode_command(&topics, &msg).unwrap(), None);
    }

    #[test]
    fn test_payload_shapes() {
        assert_eq!(
            serde_json::to_string(&DeviceStatus { device_available: true }).unwrap(),
            r#"{"device_available":true}"#
        );
        assert_eq!(
            serde_json::to_string(&RunningStatus { running: false }).unwrap(),
            r#"{"running":false}"#
        );
        assert_eq!(
            serde_json::to_string(&ErrorReport { error: "x".into() }).unwrap(),
            r#"{"error":"x"}"#
        );
    }
}
