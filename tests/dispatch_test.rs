//! Inbound message dispatch: decoding, error reporting and routing.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing_test::traced_test;

use scan_daq::config::{BoardConfig, TimingConfig};
use scan_daq::hardware::{DriverHandle, SimulatedBoard};
use scan_daq::protocol::{Publisher, Topics};
use scan_daq::scan::{ControllerHandle, ScanController, ScanState};
use scan_daq::server::dispatch;
use scan_daq::transport::{MemoryBroker, Message};

struct Fixture {
    broker: MemoryBroker,
    topics: Topics,
    publisher: Publisher,
    controller: ControllerHandle,
}

fn fixture() -> Fixture {
    let broker = MemoryBroker::new();
    let topics = Topics::default();
    let publisher = Publisher::new(Arc::new(broker.clone()), topics.clone());
    let (driver, _driver_task) = DriverHandle::spawn(Box::new(SimulatedBoard::new()), 4);
    let timing = TimingConfig {
        poll_interval_ms: 5,
        trigger_settle_ms: 1,
        trigger_pulse_ms: 1,
        ..TimingConfig::default()
    };
    let (controller, _task) =
        ScanController::spawn(driver, publisher.clone(), BoardConfig::default(), timing);
    Fixture {
        broker,
        topics,
        publisher,
        controller,
    }
}

impl Fixture {
    async fn dispatch(&self, topic: &str, payload: &str) {
        let message = Message::new(topic, payload, false);
        dispatch(&self.topics, &self.publisher, &self.controller, message).await;
    }

    fn errors(&self) -> Vec<String> {
        self.broker
            .history_for("scan/error")
            .iter()
            .map(|m| {
                let v: Value = serde_json::from_slice(&m.payload).unwrap();
                v["error"].as_str().unwrap().to_string()
            })
            .collect()
    }
}

#[tokio::test]
#[traced_test]
async fn test_invalid_json_is_reported_and_logged() {
    let f = fixture();
    f.dispatch("scan/init", "{\"rate\": ").await;

    let errors = f.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Invalid JSON:"));
    assert!(logs_contain("Rejected inbound message"));
    assert_eq!(f.controller.state().await.unwrap(), ScanState::Uninitialized);
}

#[tokio::test]
async fn test_unknown_topics_are_ignored() {
    let f = fixture();
    f.dispatch("scan/result", "garbage").await;
    f.dispatch("scan/status", "{}").await;

    assert!(f.broker.history().is_empty());
}

#[tokio::test]
async fn test_valid_init_reaches_controller() {
    let f = fixture();
    let payload = json!({
        "rate": 500,
        "dac_waveforms": {"2": [0.0, 0.5], "3": [0.0, -0.5]},
        "adc_channels": [{"type": "analog", "channel": 4}, {"type": "digital", "channel": 0}],
    });
    f.dispatch("scan/init", &payload.to_string()).await;

    assert!(f.errors().is_empty());
    let session = f.controller.session().await.unwrap().unwrap();
    assert_eq!(session.state, ScanState::Initialized);
    assert_eq!(session.rate, 500);
    assert_eq!(session.output_channels, vec![2, 3]);
    assert_eq!(session.input_channels.len(), 2);
}

#[tokio::test]
#[traced_test]
async fn test_dead_controller_is_reported() {
    let f = fixture();
    f.controller.shutdown().await;

    f.dispatch("scan/start", "{}").await;

    let errors = f.errors();
    assert_eq!(errors, vec!["Start error: scan controller is not running".to_string()]);
    assert!(logs_contain("Reporting error"));
}
