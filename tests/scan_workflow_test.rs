//! End-to-end scan workflows through the server, driven over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use scan_daq::config::{ScanConfig, TimingConfig};
use scan_daq::hardware::{DriverCall, OutputRange, Primitive, ScanDirection, SimulatedBoard};
use scan_daq::transport::{MemoryBroker, Message};
use scan_daq::{ScanResult, ScanServer};

const WAIT: Duration = Duration::from_secs(3);

fn fast_config() -> ScanConfig {
    ScanConfig {
        timing: TimingConfig {
            poll_interval_ms: 5,
            availability_interval_ms: 20,
            trigger_settle_ms: 2,
            trigger_pulse_ms: 1,
            command_queue: 8,
        },
        ..ScanConfig::default()
    }
}

/// Server running against a shared broker and board.
struct Harness {
    broker: MemoryBroker,
    board: SimulatedBoard,
    outbound: mpsc::UnboundedReceiver<Message>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<ScanResult<()>>,
}

impl Harness {
    async fn start(board: SimulatedBoard) -> Self {
        let broker = MemoryBroker::new();
        let outbound = broker.listen(&["scan/status", "scan/result", "scan/error"]);
        let server = ScanServer::new(fast_config(), Arc::new(broker.clone()), Box::new(board.clone()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server.run(async move {
            let _ = shutdown_rx.await;
        }));

        let mut harness = Self {
            broker,
            board,
            outbound,
            shutdown: Some(shutdown_tx),
            server,
        };
        assert_eq!(harness.next("scan/status").await, json!({"connected": true}));
        harness
    }

    fn send(&self, leaf: &str, payload: Value) {
        let message = Message::json(format!("scan/{}", leaf), &payload, false).unwrap();
        self.broker.send(message);
    }

    fn send_raw(&self, leaf: &str, payload: &str) {
        self.broker
            .send(Message::new(format!("scan/{}", leaf), payload, false));
    }

    /// Next payload published on `topic`, skipping other topics.
    async fn next(&mut self, topic: &str) -> Value {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let message = tokio::time::timeout_at(deadline, self.outbound.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {}", topic))
                .expect("broker closed");
            if message.topic == topic {
                return serde_json::from_slice(&message.payload).unwrap();
            }
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(WAIT, self.server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn init_payload(a: Vec<f64>, b: Vec<f64>, adc: Value) -> Value {
    json!({
        "rate": 1000,
        "dac_waveforms": {"0": a, "1": b},
        "adc_channels": adc,
    })
}

#[tokio::test]
async fn test_single_channel_capture_published_as_rows() {
    let board = SimulatedBoard::with_capture(vec![10.0, 20.0, 30.0, 40.0]);
    let mut h = Harness::start(board).await;

    h.send("init", init_payload(vec![0.0, 1.0, 2.0, 3.0], vec![3.0, 2.0, 1.0, 0.0], json!([0])));
    assert_eq!(h.next("scan/status").await, json!({"running": false}));

    h.send("start", json!({}));
    assert_eq!(h.next("scan/status").await, json!({"running": true}));
    assert_eq!(
        h.next("scan/result").await,
        json!([[10.0], [20.0], [30.0], [40.0]])
    );
    assert_eq!(h.next("scan/status").await, json!({"running": false}));

    h.stop().await;
}

#[tokio::test]
async fn test_output_buffer_is_frame_major() {
    let board = SimulatedBoard::new();
    let mut h = Harness::start(board.clone()).await;
    let range = OutputRange::default();

    h.send("init", init_payload(vec![1.0, 2.0, 3.0], vec![-1.0, -2.0, -3.0], json!([0, 1])));
    h.next("scan/status").await;
    h.send("start", json!({}));
    h.next("scan/result").await;

    let staged = board
        .calls()
        .into_iter()
        .find_map(|call| match call {
            DriverCall::StartOutputScan { channels, buffer } => Some((channels, buffer)),
            _ => None,
        })
        .unwrap();
    assert_eq!(staged.0, vec![0, 1]);
    let expected: Vec<u16> = [1.0, -1.0, 2.0, -2.0, 3.0, -3.0]
        .iter()
        .map(|v| range.to_raw(*v))
        .collect();
    assert_eq!(staged.1, expected);

    h.stop().await;
}

#[tokio::test]
async fn test_loopback_columns_follow_channel_list() {
    let mut h = Harness::start(SimulatedBoard::new()).await;

    h.send(
        "init",
        init_payload(
            vec![1.0, 2.0],
            vec![-5.0, -6.0],
            json!([1, 0, {"type": "counter", "channel": 0}]),
        ),
    );
    h.next("scan/status").await;
    h.send("start", json!({}));

    let rows = h.next("scan/result").await;
    let rows: Vec<Vec<f64>> = serde_json::from_value(rows).unwrap();
    assert_eq!(rows.len(), 2);
    for (p, (a, b)) in [(1.0, -5.0), (2.0, -6.0)].iter().enumerate() {
        assert!((rows[p][0] - b).abs() < 1e-3);
        assert!((rows[p][1] - a).abs() < 1e-3);
        assert_eq!(rows[p][2], p as f64);
    }

    h.stop().await;
}

#[tokio::test]
async fn test_invalid_init_reports_field() {
    let mut h = Harness::start(SimulatedBoard::new()).await;

    h.send("init", init_payload(vec![0.0, 1.0], vec![0.0], json!([0])));
    let error = h.next("scan/error").await;
    let text = error["error"].as_str().unwrap();
    assert!(text.starts_with("Initialization error:"), "{}", text);
    assert!(text.contains("dac_waveforms"), "{}", text);

    h.send(
        "init",
        json!({"rate": -1, "dac_waveforms": {"0": [0.0], "1": [0.0]}, "adc_channels": [0]}),
    );
    let error = h.next("scan/error").await;
    assert!(error["error"].as_str().unwrap().contains("'rate'"));

    h.stop().await;
}

#[tokio::test]
async fn test_start_before_init_is_rejected() {
    let board = SimulatedBoard::new();
    let mut h = Harness::start(board.clone()).await;

    h.send("start", json!({}));
    let error = h.next("scan/error").await;
    assert!(error["error"]
        .as_str()
        .unwrap()
        .starts_with("Start error:"));
    assert!(!board
        .calls()
        .iter()
        .any(|c| matches!(c, DriverCall::StartInputScan { .. })));

    h.stop().await;
}

#[tokio::test]
async fn test_invalid_json_reported() {
    let mut h = Harness::start(SimulatedBoard::new()).await;

    h.send_raw("init", "{not json");
    let error = h.next("scan/error").await;
    assert!(error["error"].as_str().unwrap().starts_with("Invalid JSON"));

    h.send_raw("abort", "");
    let error = h.next("scan/error").await;
    assert!(error["error"].as_str().unwrap().starts_with("Invalid JSON"));

    h.stop().await;
}

#[tokio::test]
async fn test_abort_while_running_suppresses_result() {
    let board = SimulatedBoard::new();
    board.hold_running(true);
    let mut h = Harness::start(board.clone()).await;

    h.send("init", init_payload(vec![0.0; 4], vec![0.0; 4], json!([0])));
    h.next("scan/status").await;
    h.send("start", json!({}));
    assert_eq!(h.next("scan/status").await, json!({"running": true}));

    h.send("abort", json!({}));
    loop {
        if h.next("scan/status").await == json!({"running": false}) {
            break;
        }
    }
    assert!(!board.is_armed(ScanDirection::Input));
    assert!(!board.is_armed(ScanDirection::Output));

    board.hold_running(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.broker.history_for("scan/result").is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_abort_is_accepted_in_any_state() {
    let mut h = Harness::start(SimulatedBoard::new()).await;

    h.send("abort", json!({}));
    assert_eq!(h.next("scan/status").await, json!({"running": false}));

    h.send("init", init_payload(vec![0.0], vec![0.0], json!([0])));
    h.next("scan/status").await;
    h.send("abort", json!({}));
    assert_eq!(h.next("scan/status").await, json!({"running": false}));

    // Aborted sessions cannot be started again without a new init.
    h.send("start", json!({}));
    let error = h.next("scan/error").await;
    assert!(error["error"].as_str().unwrap().contains("ABORTED"));

    h.stop().await;
}

#[tokio::test]
async fn test_status_fault_reported() {
    let board = SimulatedBoard::new();
    board.hold_running(true);
    let mut h = Harness::start(board.clone()).await;

    h.send("init", init_payload(vec![0.0; 4], vec![0.0; 4], json!([0])));
    h.next("scan/status").await;
    h.send("start", json!({}));
    h.next("scan/status").await;
    board.fail_on(Primitive::ScanStatus);

    let error = h.next("scan/error").await;
    assert!(error["error"]
        .as_str()
        .unwrap()
        .starts_with("Status check error:"));

    h.stop().await;
}

#[tokio::test]
async fn test_result_fault_reported() {
    let board = SimulatedBoard::new();
    board.fail_on(Primitive::TakeInputBuffer);
    let mut h = Harness::start(board).await;

    h.send("init", init_payload(vec![0.0; 2], vec![0.0; 2], json!([0])));
    h.next("scan/status").await;
    h.send("start", json!({}));

    let error = h.next("scan/error").await;
    assert!(error["error"]
        .as_str()
        .unwrap()
        .starts_with("Result publish error:"));
    assert!(h.broker.history_for("scan/result").is_empty());

    h.stop().await;
}
