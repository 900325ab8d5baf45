//! Scan controller actor.
//!
//! The controller owns the current [`ScanSession`] and is the only code that
//! changes its state. Everything reaches it as a message:
//!
//! ```text
//! dispatch loop ──ControllerCommand──▶ ┌──────────────────┐ ──▶ DriverHandle
//!                                      │  ScanController  │
//! CompletionMonitor ──MonitorEvent───▶ └──────────────────┘ ──▶ Publisher
//! ```
//!
//! Monitor events carry the id of the session they were started for. Events for
//! a replaced session, or for a session that is no longer RUNNING, are dropped,
//! so a result can never be published after an abort.
//!
//! Every command handler ends with exactly one outcome on the wire: a status
//! message on success or an `{error}` report prefixed with the command's context.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{BoardConfig, TimingConfig};
use crate::error::{DriverError, DriverResult, ScanError, ScanResult};
use crate::hardware::{
    DriverHandle, InputChannel, InputScanRequest, OutputScanRequest, ScanDirection,
    TriggerConfig,
};
use crate::protocol::{Command, Publisher};

use super::completion::{CompletionMonitor, MonitorEvent, MonitorEventKind};
use super::result::assemble_result;
use super::session::{InitRequest, ScanSession, ScanState};

/// Read-only view of the current session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Session id
    pub id: u64,
    /// Lifecycle state
    pub state: ScanState,
    /// Samples per second per channel
    pub rate: u32,
    /// Samples per channel
    pub points_per_channel: usize,
    /// Output channel ids, ascending
    pub output_channels: Vec<u32>,
    /// Input channels in capture order
    pub input_channels: Vec<InputChannel>,
    /// Interleaved raw output codes
    pub output_buffer: Arc<[u16]>,
}

impl From<&ScanSession> for SessionInfo {
    fn from(session: &ScanSession) -> Self {
        Self {
            id: session.id(),
            state: session.state(),
            rate: session.rate(),
            points_per_channel: session.points_per_channel(),
            output_channels: session.output_channels().to_vec(),
            input_channels: session.input_channels().to_vec(),
            output_buffer: session.output_buffer(),
        }
    }
}

/// Requests accepted by the controller task.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Run an inbound protocol command.
    ///
    /// The response carries the handler outcome; failures have already been
    /// published to the error topic when it is sent.
    Execute {
        /// Decoded command
        command: Command,
        /// Handler outcome
        response: oneshot::Sender<ScanResult<()>>,
    },

    /// Current session state (`UNINITIALIZED` when there is no session).
    GetState {
        /// Receives the state
        response: oneshot::Sender<ScanState>,
    },

    /// Snapshot of the current session.
    GetSession {
        /// Receives the snapshot
        response: oneshot::Sender<Option<SessionInfo>>,
    },

    /// Stop any running scan and exit the actor loop.
    Shutdown {
        /// Signalled once the scan is stopped
        response: oneshot::Sender<()>,
    },
}

impl ControllerCommand {
    /// `Execute` request and its response receiver.
    pub fn execute(command: Command) -> (Self, oneshot::Receiver<ScanResult<()>>) {
        let (response, rx) = oneshot::channel();
        (Self::Execute { command, response }, rx)
    }

    /// `GetState` request and its response receiver.
    pub fn get_state() -> (Self, oneshot::Receiver<ScanState>) {
        let (response, rx) = oneshot::channel();
        (Self::GetState { response }, rx)
    }

    /// `GetSession` request and its response receiver.
    pub fn get_session() -> (Self, oneshot::Receiver<Option<SessionInfo>>) {
        let (response, rx) = oneshot::channel();
        (Self::GetSession { response }, rx)
    }

    /// `Shutdown` request and its response receiver.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (response, rx) = oneshot::channel();
        (Self::Shutdown { response }, rx)
    }
}

/// Cloneable client side of the controller task.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    async fn request<R>(
        &self,
        (command, rx): (ControllerCommand, oneshot::Receiver<R>),
    ) -> ScanResult<R> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ScanError::ControllerUnavailable)?;
        rx.await.map_err(|_| ScanError::ControllerUnavailable)
    }

    /// Run `command` and wait for its handler to finish.
    pub async fn execute(&self, command: Command) -> ScanResult<()> {
        self.request(ControllerCommand::execute(command)).await?
    }

    /// `init` with a raw JSON payload.
    pub async fn init(&self, payload: Value) -> ScanResult<()> {
        self.execute(Command::Init(payload)).await
    }

    /// `start` the initialized session.
    pub async fn start(&self) -> ScanResult<()> {
        self.execute(Command::Start).await
    }

    /// `abort` the current scan, if any.
    pub async fn abort(&self) -> ScanResult<()> {
        self.execute(Command::Abort).await
    }

    /// Current session state.
    pub async fn state(&self) -> ScanResult<ScanState> {
        self.request(ControllerCommand::get_state()).await
    }

    /// Snapshot of the current session, if any.
    pub async fn session(&self) -> ScanResult<Option<SessionInfo>> {
        self.request(ControllerCommand::get_session()).await
    }

    /// Stop the controller. Succeeds if it is already gone.
    pub async fn shutdown(&self) {
        if self.request(ControllerCommand::shutdown()).await.is_err() {
            debug!("Controller already stopped");
        }
    }
}

/// Owner of the scan session and its lifecycle.
pub struct ScanController {
    driver: DriverHandle,
    publisher: Publisher,
    board: BoardConfig,
    timing: TimingConfig,
    session: Option<ScanSession>,
    monitor: Option<CompletionMonitor>,
    events_tx: mpsc::UnboundedSender<MonitorEvent>,
    next_session_id: u64,
}

impl ScanController {
    /// Controller driving `driver` and reporting through `publisher`.
    ///
    /// Returns the controller and the receiving end of its monitor event
    /// channel, both consumed by [`run`](Self::run).
    pub fn new(
        driver: DriverHandle,
        publisher: Publisher,
        board: BoardConfig,
        timing: TimingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            driver,
            publisher,
            board,
            timing,
            session: None,
            monitor: None,
            events_tx,
            next_session_id: 1,
        };
        (controller, events_rx)
    }

    /// Spawn the controller task.
    pub fn spawn(
        driver: DriverHandle,
        publisher: Publisher,
        board: BoardConfig,
        timing: TimingConfig,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(timing.command_queue.max(1));
        let (controller, events_rx) = Self::new(driver, publisher, board, timing);
        let task = tokio::spawn(controller.run(command_rx, events_rx));
        (ControllerHandle { tx: command_tx }, task)
    }

    /// Actor loop. Commands and monitor events are handled one at a time.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<ControllerCommand>,
        mut events_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    ) {
        info!(driver = self.driver.name(), "Scan controller started");

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("Command channel closed, shutting down controller");
                        self.shutdown().await;
                        break;
                    };
                    match command {
                        ControllerCommand::Execute { command, response } => {
                            let result = self.execute(command).await;
                            let _ = response.send(result);
                        }
                        ControllerCommand::GetState { response } => {
                            let _ = response.send(self.state());
                        }
                        ControllerCommand::GetSession { response } => {
                            let _ = response.send(self.session.as_ref().map(SessionInfo::from));
                        }
                        ControllerCommand::Shutdown { response } => {
                            info!("Shutdown command received");
                            self.shutdown().await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }

                Some(event) = events_rx.recv() => {
                    self.handle_monitor_event(event).await;
                }
            }
        }

        info!("Scan controller stopped");
    }

    fn state(&self) -> ScanState {
        self.session
            .as_ref()
            .map_or(ScanState::Uninitialized, ScanSession::state)
    }

    /// Run one command handler and publish its failure, if any.
    async fn execute(&mut self, command: Command) -> ScanResult<()> {
        let kind = command.kind();
        debug!(command = %kind, state = %self.state(), "Handling command");

        let result = match command {
            Command::Init(payload) => self.handle_init(&payload).await,
            Command::Start => self.handle_start().await,
            Command::Abort => self.handle_abort().await,
        };

        if let Err(e) = &result {
            warn!(command = %kind, error = %e, "Command failed");
            self.publisher.error(kind.error_context(), e).await;
        }
        result
    }

    async fn handle_init(&mut self, payload: &Value) -> ScanResult<()> {
        let request = InitRequest::from_json(payload)?;
        let range = self.driver.output_range().await?;
        let session = ScanSession::new(self.next_session_id, request, range)?;
        self.next_session_id += 1;

        if self.state().is_running() {
            info!("Re-initialized while running, stopping previous scan");
            self.stop_monitor().await;
            if let Err(e) = self.stop_scans().await {
                warn!(error = %e, "Failed to stop previous scan");
            }
        }

        info!(
            session = session.id(),
            rate = session.rate(),
            points = session.points_per_channel(),
            outputs = ?session.output_channels(),
            inputs = session.input_channels().len(),
            range = %range.description(),
            "Scan initialized"
        );
        self.session = Some(session);
        self.publisher.running(false).await;
        Ok(())
    }

    async fn handle_start(&mut self) -> ScanResult<()> {
        let state = self.state();
        let Some(session) = self.session.as_mut().filter(|_| state == ScanState::Initialized)
        else {
            return Err(ScanError::InvalidState {
                command: "start",
                state,
            });
        };

        let session_id = session.id();
        let input = session.input_request(self.board.input_range_volts);
        let buffer = session.take_input_buffer();
        let output = session.output_request();

        if let Err(e) = self.arm_and_trigger(input, buffer, output).await {
            error!(session = session_id, error = %e, "Arming failed, stopping scans");
            if let Err(stop_err) = self.stop_scans().await {
                warn!(error = %stop_err, "Cleanup after arming failure failed");
            }
            self.set_state(ScanState::Error);
            return Err(e.into());
        }

        self.set_state(ScanState::Running);
        info!(session = session_id, "Scan triggered");
        self.publisher.running(true).await;

        self.monitor = Some(CompletionMonitor::spawn(
            session_id,
            self.driver.clone(),
            self.timing.poll_interval(),
            self.events_tx.clone(),
        ));
        Ok(())
    }

    /// Configure the trigger, arm input then output, and pulse the trigger line.
    async fn arm_and_trigger(
        &self,
        input: InputScanRequest,
        buffer: Vec<f64>,
        output: OutputScanRequest,
    ) -> DriverResult<()> {
        let trigger = TriggerConfig::rising(self.board.trigger_port, self.board.trigger_bit);
        self.driver.configure_trigger(trigger).await?;
        self.driver.start_input_scan(input, buffer).await?;
        self.driver.start_output_scan(output).await?;

        sleep(self.timing.trigger_settle()).await;
        self.driver
            .set_digital_bit(trigger.port, trigger.bit, true)
            .await?;
        sleep(self.timing.trigger_pulse()).await;
        self.driver
            .set_digital_bit(trigger.port, trigger.bit, false)
            .await
    }

    async fn handle_abort(&mut self) -> ScanResult<()> {
        self.stop_monitor().await;
        let stopped = self.stop_scans().await;

        if let Some(session) = self.session.as_mut() {
            info!(session = session.id(), from = %session.state(), "Scan aborted");
            session.set_state(ScanState::Aborted);
        } else {
            debug!("Abort with no session");
        }

        self.publisher.running(false).await;
        stopped.map_err(ScanError::from)
    }

    async fn handle_monitor_event(&mut self, event: MonitorEvent) {
        let current = self
            .session
            .as_ref()
            .filter(|s| s.id() == event.session_id && s.state() == ScanState::Running);
        if current.is_none() {
            debug!(session = event.session_id, kind = ?event.kind, "Dropping stale monitor event");
            return;
        }

        match event.kind {
            MonitorEventKind::Heartbeat => {
                self.publisher.running(true).await;
            }
            MonitorEventKind::Idle => {
                self.monitor = None;
                match self.collect_result().await {
                    Ok(rows) => {
                        self.set_state(ScanState::Complete);
                        info!(session = event.session_id, points = rows.len(), "Scan complete");
                        self.publisher.result(&rows).await;
                        self.publisher.running(false).await;
                    }
                    Err(e) => {
                        error!(session = event.session_id, error = %e, "Failed to collect result");
                        self.set_state(ScanState::Error);
                        self.publisher.error("Result publish", &e).await;
                    }
                }
            }
            MonitorEventKind::Fault(e) => {
                self.monitor = None;
                self.fail_status(event.session_id, e).await;
            }
        }
    }

    async fn fail_status(&mut self, session_id: u64, e: DriverError) {
        error!(session = session_id, error = %e, "Status check failed");
        self.set_state(ScanState::Error);
        self.publisher.error("Status check", &e).await;
    }

    async fn collect_result(&mut self) -> ScanResult<Vec<Vec<f64>>> {
        let buffer = self.driver.take_input_buffer().await?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ScanError::Protocol("session vanished during collection".into()))?;
        let rows = assemble_result(
            &buffer,
            session.points_per_channel(),
            session.input_channels().len(),
        )?;
        session.store_input_buffer(buffer);
        Ok(rows)
    }

    /// Stop both directions, attempting each even if the first fails.
    async fn stop_scans(&self) -> DriverResult<()> {
        let input = self.driver.stop_background(ScanDirection::Input).await;
        let output = self.driver.stop_background(ScanDirection::Output).await;
        input.and(output)
    }

    async fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            debug!(session = monitor.session_id(), "Stopping completion monitor");
            monitor.stop().await;
        }
    }

    fn set_state(&mut self, state: ScanState) {
        if let Some(session) = self.session.as_mut() {
            debug!(session = session.id(), from = %session.state(), to = %state, "State change");
            session.set_state(state);
        }
    }

    async fn shutdown(&mut self) {
        self.stop_monitor().await;
        if self.state().is_running() {
            info!("Stopping running scan on shutdown");
            if let Err(e) = self.stop_scans().await {
                warn!(error = %e, "Failed to stop scan on shutdown");
            }
            self.set_state(ScanState::Aborted);
            self.publisher.running(false).await;
        }
    }
}
