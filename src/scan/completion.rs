//! Completion monitor.
//!
//! Polls the input scan status once per interval and reports back to the
//! controller, which owns every state transition. The monitor never publishes and
//! never touches the session itself.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::DriverError;
use crate::hardware::{DriverHandle, ScanDirection, ScanStatus};

/// What one poll observed.
#[derive(Debug)]
pub enum MonitorEventKind {
    /// Scan still running
    Heartbeat,
    /// Scan finished; the capture buffer is ready
    Idle,
    /// Status query failed; the monitor has stopped
    Fault(DriverError),
}

/// Poll result tagged with the session it belongs to.
#[derive(Debug)]
pub struct MonitorEvent {
    /// Session the monitor was started for
    pub session_id: u64,
    /// What the poll observed
    pub kind: MonitorEventKind,
}

/// Handle to a running completion poll loop.
pub struct CompletionMonitor {
    session_id: u64,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CompletionMonitor {
    /// Start polling for `session_id`. Events go to `events`.
    pub fn spawn(
        session_id: u64,
        driver: DriverHandle,
        poll_interval: Duration,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(poll_loop(
            session_id,
            driver,
            poll_interval,
            events,
            shutdown_rx,
        ));
        Self {
            session_id,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Session being monitored.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Signal the loop to exit and wait for it.
    ///
    /// The loop checks for shutdown between polls, so this returns within one
    /// driver call.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(session = self.session_id, error = %e, "Completion monitor task failed");
        }
    }
}

async fn poll_loop(
    session_id: u64,
    driver: DriverHandle,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<MonitorEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!(session = session_id, ?poll_interval, "Completion monitor started");

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!(session = session_id, "Completion monitor stopped");
                break;
            }
            _ = sleep(poll_interval) => {
                let kind = match driver.scan_status(ScanDirection::Input).await {
                    Ok(ScanStatus::Running) => MonitorEventKind::Heartbeat,
                    Ok(ScanStatus::Idle) => MonitorEventKind::Idle,
                    Err(e) => MonitorEventKind::Fault(e),
                };
                trace!(session = session_id, ?kind, "Polled input scan");

                let terminal = !matches!(kind, MonitorEventKind::Heartbeat);
                if events.send(MonitorEvent { session_id, kind }).is_err() {
                    debug!(session = session_id, "Controller gone, stopping monitor");
                    break;
                }
                if terminal {
                    break;
                }
            }
        }
    }
}
