//! Device availability heartbeat.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::hardware::DriverHandle;
use crate::protocol::Publisher;

/// Query the board once. A failing query counts as unavailable.
pub async fn probe(driver: &DriverHandle) -> bool {
    match driver.is_available().await {
        Ok(available) => available,
        Err(e) => {
            debug!(error = %e, "Availability query failed");
            false
        }
    }
}

/// Periodically publishes retained `{device_available}` for the lifetime of the
/// process, independent of any scan session.
pub struct AvailabilityMonitor {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl AvailabilityMonitor {
    /// Start the heartbeat. The first check runs immediately.
    pub fn spawn(driver: DriverHandle, publisher: Publisher, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(heartbeat_loop(driver, publisher, period, shutdown_rx));
        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Stop the heartbeat and wait for the task to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Availability monitor task failed");
        }
    }
}

async fn heartbeat_loop(
    driver: DriverHandle,
    publisher: Publisher,
    period: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    info!(?period, "Availability monitor started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = None;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Availability monitor stopped");
                break;
            }
            _ = ticker.tick() => {
                let available = probe(&driver).await;
                if last != Some(available) {
                    info!(available, "Device availability changed");
                    last = Some(available);
                }
                publisher.device_available(available).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Primitive, SimulatedBoard};
    use crate::protocol::Topics;
    use crate::transport::MemoryBroker;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_probe_treats_fault_as_unavailable() {
        let board = SimulatedBoard::new();
        let (driver, _task) = DriverHandle::spawn(Box::new(board.clone()), 8);
        assert!(probe(&driver).await);

        board.set_available(false);
        assert!(!probe(&driver).await);

        board.set_available(true);
        board.fail_on(Primitive::IsAvailable);
        assert!(!probe(&driver).await);
    }

    #[tokio::test]
    async fn test_heartbeat_is_retained() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()), Topics::default());
        let (driver, _task) = DriverHandle::spawn(Box::new(SimulatedBoard::new()), 8);
        let mut rx = broker.listen(&["scan/device"]);

        let monitor = AvailabilityMonitor::spawn(driver, publisher, Duration::from_millis(5));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        monitor.stop().await;

        assert!(first.retain && second.retain);
        assert_eq!(first.payload_str(), Some(r#"{"device_available":true}"#));
        assert!(broker.retained("scan/device").is_some());
    }
}
