//! Simulated DAQ Board
//!
//! An in-process [`DaqDriver`] for running the controller without hardware and for
//! exercising it in tests.
//!
//! # Behavior
//!
//! - Scans armed with `start_input_scan` / `start_output_scan` wait for a rising
//!   edge on the configured trigger line.
//! - After the edge, a scan runs for `points_per_channel / rate` seconds and then
//!   reports [`ScanStatus::Idle`].
//! - Captured samples are either canned data ([`SimulatedBoard::with_capture`]) or
//!   a loopback: analog input `n` reads output channel `n mod outputs`, counters read
//!   the point index, digital ports read 0.
//! - Every primitive can be made to fail with [`SimulatedBoard::fail_on`], and every
//!   call is recorded in a journal ([`SimulatedBoard::calls`]).
//!
//! Clones share the same board state, so a test can keep one clone for inspection
//! while the controller owns another.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::error::{DriverError, DriverErrorKind, DriverResult};
use crate::hardware::driver::{
    DaqDriver, InputChannel, InputChannelKind, InputScanRequest, OutputRange, OutputScanRequest,
    ScanDirection, ScanStatus, TriggerConfig, TriggerEdge,
};

const DRIVER_NAME: &str = "simulated";

/// Driver primitive, used to target fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Primitive {
    IsAvailable,
    OutputRange,
    ConfigureTrigger,
    SetDigitalBit,
    StartInputScan,
    StartOutputScan,
    ScanStatus,
    TakeInputBuffer,
    StopBackground,
}

/// Journal entry for one driver call.
///
/// Variants mirror the [`DaqDriver`] methods and record their arguments.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum DriverCall {
    IsAvailable,
    OutputRange,
    ConfigureTrigger(TriggerConfig),
    SetDigitalBit { port: u32, bit: u32, high: bool },
    StartInputScan { channels: Vec<InputChannel>, total_count: usize },
    StartOutputScan { channels: Vec<u32>, buffer: Vec<u16> },
    ScanStatus(ScanDirection),
    TakeInputBuffer,
    StopBackground(ScanDirection),
}

struct ArmedInput {
    request: InputScanRequest,
    buffer: Vec<f64>,
}

struct BoardState {
    available: bool,
    output_range: OutputRange,
    trigger: Option<TriggerConfig>,
    trigger_line_high: bool,
    triggered_at: Option<Instant>,
    input: Option<ArmedInput>,
    output: Option<OutputScanRequest>,
    finished_input: Option<Vec<f64>>,
    capture: Option<Vec<f64>>,
    hold_running: bool,
    faults: HashSet<Primitive>,
    calls: Vec<DriverCall>,
}

impl BoardState {
    fn check(&self, primitive: Primitive) -> DriverResult<()> {
        if self.faults.contains(&primitive) {
            return Err(DriverError::new(
                DRIVER_NAME,
                DriverErrorKind::Hardware,
                format!("injected fault in {:?}", primitive),
            ));
        }
        Ok(())
    }

    fn elapsed_since_trigger(&self) -> Option<Duration> {
        self.triggered_at.map(|t| t.elapsed())
    }

    fn input_done(&self) -> bool {
        match (&self.input, self.elapsed_since_trigger()) {
            (Some(armed), Some(elapsed)) if !self.hold_running => {
                elapsed >= scan_duration(armed.request.points_per_channel, armed.request.rate)
            }
            _ => false,
        }
    }

    fn output_done(&self) -> bool {
        match (&self.output, self.elapsed_since_trigger()) {
            (Some(request), Some(elapsed)) if !self.hold_running => {
                let points = request.buffer.len() / request.channels.len().max(1);
                elapsed >= scan_duration(points, request.rate)
            }
            _ => false,
        }
    }

    fn finish_input(&mut self) {
        let Some(mut armed) = self.input.take() else {
            return;
        };

        match &self.capture {
            Some(capture) => {
                for (slot, value) in armed.buffer.iter_mut().zip(capture.iter()) {
                    *slot = *value;
                }
            }
            None => self.loopback(&mut armed),
        }

        debug!(
            samples = armed.buffer.len(),
            channels = armed.request.channels.len(),
            "Simulated input scan complete"
        );
        self.finished_input = Some(armed.buffer);
    }

    fn loopback(&self, armed: &mut ArmedInput) {
        let n_channels = armed.request.channels.len();
        for (idx, slot) in armed.buffer.iter_mut().enumerate() {
            let point = idx / n_channels;
            let channel = armed.request.channels[idx % n_channels];
            *slot = match channel.kind {
                InputChannelKind::Analog => self.output_sample(channel.channel, point),
                InputChannelKind::Digital => 0.0,
                InputChannelKind::Counter => point as f64,
            };
        }
    }

    fn output_sample(&self, input_channel: u32, point: usize) -> f64 {
        let Some(output) = &self.output else {
            return 0.0;
        };
        let n_outputs = output.channels.len();
        if n_outputs == 0 {
            return 0.0;
        }
        let column = input_channel as usize % n_outputs;
        output
            .buffer
            .get(point * n_outputs + column)
            .map(|raw| output.range.to_volts(*raw))
            .unwrap_or(0.0)
    }

    fn armed(&self) -> bool {
        self.input.is_some() || self.output.is_some()
    }
}

fn scan_duration(points: usize, rate: u32) -> Duration {
    Duration::from_secs_f64(points as f64 / f64::from(rate.max(1)))
}

/// Simulated multi-function DAQ board.
#[derive(Clone)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimulatedBoard {
    /// Available board with a ±10 V, 16-bit output range and loopback capture.
    pub fn new() -> Self {
        Self::with_output_range(OutputRange::default())
    }

    /// Board with a specific first output range.
    pub fn with_output_range(output_range: OutputRange) -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                available: true,
                output_range,
                trigger: None,
                trigger_line_high: false,
                triggered_at: None,
                input: None,
                output: None,
                finished_input: None,
                capture: None,
                hold_running: false,
                faults: HashSet::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Board configured from the simulation section of the config.
    pub fn from_config(config: &SimulationConfig) -> Self {
        let board = Self::with_output_range(OutputRange::new(
            config.output_range_min,
            config.output_range_max,
            config.resolution_bits,
        ));
        board.set_available(config.available);
        board
    }

    /// Board that returns `capture` (frame-major) instead of loopback data.
    pub fn with_capture(capture: Vec<f64>) -> Self {
        let board = Self::new();
        board.state.lock().capture = Some(capture);
        board
    }

    /// Set the result of availability probes.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Make `primitive` fail until [`clear_faults`](Self::clear_faults).
    pub fn fail_on(&self, primitive: Primitive) {
        self.state.lock().faults.insert(primitive);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Keep triggered scans running until released.
    pub fn hold_running(&self, hold: bool) {
        self.state.lock().hold_running = hold;
    }

    /// Snapshot of the call journal.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Clear the call journal.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Whether a trigger edge has released the armed scans.
    pub fn is_triggered(&self) -> bool {
        self.state.lock().triggered_at.is_some()
    }

    /// Whether a scan is armed or running in `direction`.
    pub fn is_armed(&self, direction: ScanDirection) -> bool {
        let state = self.state.lock();
        match direction {
            ScanDirection::Input => state.input.is_some(),
            ScanDirection::Output => state.output.is_some(),
        }
    }

    /// Current level of the trigger line.
    pub fn trigger_line_high(&self) -> bool {
        self.state.lock().trigger_line_high
    }
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqDriver for SimulatedBoard {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn is_available(&mut self) -> DriverResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::IsAvailable);
        state.check(Primitive::IsAvailable)?;
        Ok(state.available)
    }

    fn output_range(&mut self) -> DriverResult<OutputRange> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::OutputRange);
        state.check(Primitive::OutputRange)?;
        Ok(state.output_range)
    }

    fn configure_trigger(&mut self, trigger: &TriggerConfig) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::ConfigureTrigger(*trigger));
        state.check(Primitive::ConfigureTrigger)?;
        state.trigger = Some(*trigger);
        state.trigger_line_high = false;
        state.triggered_at = None;
        debug!(port = trigger.port, bit = trigger.bit, "Simulated trigger configured");
        Ok(())
    }

    fn set_digital_bit(&mut self, port: u32, bit: u32, high: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::SetDigitalBit { port, bit, high });
        state.check(Primitive::SetDigitalBit)?;

        let Some(trigger) = state.trigger else {
            return Ok(());
        };
        if trigger.port != port || trigger.bit != bit {
            return Ok(());
        }

        let was_high = state.trigger_line_high;
        state.trigger_line_high = high;
        let edge = match trigger.edge {
            TriggerEdge::Rising => !was_high && high,
            TriggerEdge::Falling => was_high && !high,
        };

        if edge && state.armed() && state.triggered_at.is_none() {
            state.triggered_at = Some(Instant::now());
            info!("Simulated trigger edge released armed scans");
        }
        Ok(())
    }

    fn start_input_scan(
        &mut self,
        request: InputScanRequest,
        buffer: Vec<f64>,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::StartInputScan {
            channels: request.channels.clone(),
            total_count: request.total_count(),
        });
        state.check(Primitive::StartInputScan)?;

        if state.input.is_some() {
            return Err(DriverError::new(
                DRIVER_NAME,
                DriverErrorKind::Hardware,
                "input scan already running",
            ));
        }
        if request.rate == 0 || request.channels.is_empty() {
            return Err(DriverError::new(
                DRIVER_NAME,
                DriverErrorKind::Configuration,
                "input scan needs a positive rate and at least one channel",
            ));
        }
        if buffer.len() != request.total_count() {
            return Err(DriverError::new(
                DRIVER_NAME,
                DriverErrorKind::Configuration,
                format!(
                    "input buffer holds {} samples, scan needs {}",
                    buffer.len(),
                    request.total_count()
                ),
            ));
        }

        state.finished_input = None;
        state.triggered_at = None;
        state.input = Some(ArmedInput { request, buffer });
        Ok(())
    }

    fn start_output_scan(&mut self, request: OutputScanRequest) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::StartOutputScan {
            channels: request.channels.clone(),
            buffer: request.buffer.to_vec(),
        });
        state.check(Primitive::StartOutputScan)?;

        if state.output.is_some() {
            return Err(DriverError::new(
                DRIVER_NAME,
                DriverErrorKind::Hardware,
                "output scan already running",
            ));
        }
        if request.rate == 0
            || request.channels.is_empty()
            || request.buffer.len() % request.channels.len() != 0
        {
            return Err(DriverError::new(
                DRIVER_NAME,
                DriverErrorKind::Configuration,
                "output buffer length must be a multiple of the channel count",
            ));
        }

        state.output = Some(request);
        Ok(())
    }

    fn scan_status(&mut self, direction: ScanDirection) -> DriverResult<ScanStatus> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::ScanStatus(direction));
        state.check(Primitive::ScanStatus)?;

        // Output completes first so loopback capture still sees its samples.
        let input_done = state.input_done();
        if input_done {
            state.finish_input();
        }
        if state.output_done() && state.input.is_none() {
            state.output = None;
        }

        let running = match direction {
            ScanDirection::Input => state.input.is_some(),
            ScanDirection::Output => state.output.is_some(),
        };
        Ok(if running {
            ScanStatus::Running
        } else {
            ScanStatus::Idle
        })
    }

    fn take_input_buffer(&mut self) -> DriverResult<Vec<f64>> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::TakeInputBuffer);
        state.check(Primitive::TakeInputBuffer)?;
        state.finished_input.take().ok_or_else(|| {
            DriverError::new(
                DRIVER_NAME,
                DriverErrorKind::Hardware,
                "no completed input scan",
            )
        })
    }

    fn stop_background(&mut self, direction: ScanDirection) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::StopBackground(direction));
        state.check(Primitive::StopBackground)?;

        match direction {
            ScanDirection::Input => state.input = None,
            ScanDirection::Output => state.output = None,
        }
        if !state.armed() {
            state.triggered_at = None;
        }
        Ok(())
    }
}
