//! Driver primitives for triggered scan hardware.
//!
//! [`DaqDriver`] is the contract between the scan controller and a DAQ board.
//! The controller never talks to a board directly. It drives these primitives
//! through a [`DriverHandle`](crate::hardware::DriverHandle), which owns the
//! driver and serializes every call.
//!
//! # Contract
//! - Calls are synchronous and expected to return promptly. Scans themselves run
//!   in the background on the board; completion is observed with
//!   [`scan_status`](DaqDriver::scan_status).
//! - `start_input_scan` takes ownership of the capture buffer. It is handed back by
//!   [`take_input_buffer`](DaqDriver::take_input_buffer) once the scan reports idle.
//! - `stop_background` is idempotent and must succeed when nothing is running.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DriverResult;

/// Direction of a background scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanDirection {
    /// Analog/digital/counter capture
    Input,
    /// Analog waveform generation
    Output,
}

impl fmt::Display for ScanDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanDirection::Input => write!(f, "input"),
            ScanDirection::Output => write!(f, "output"),
        }
    }
}

/// Background scan status as reported by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// No scan in progress (finished, stopped, or never started)
    Idle,
    /// Armed or acquiring
    Running,
}

/// Voltage range of an analog output, with the DAC resolution used to scale
/// engineering units into raw codes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputRange {
    /// Minimum voltage
    pub min: f64,
    /// Maximum voltage
    pub max: f64,
    /// DAC resolution in bits (1-16)
    pub resolution_bits: u32,
}

impl Default for OutputRange {
    fn default() -> Self {
        Self {
            min: -10.0,
            max: 10.0,
            resolution_bits: 16,
        }
    }
}

impl OutputRange {
    /// Create a new range.
    pub fn new(min: f64, max: f64, resolution_bits: u32) -> Self {
        Self {
            min,
            max,
            resolution_bits,
        }
    }

    /// Get the span (max - min) of this range.
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Largest raw code the DAC accepts.
    pub fn maxdata(&self) -> u16 {
        let bits = self.resolution_bits.clamp(1, 16);
        ((1u32 << bits) - 1) as u16
    }

    /// Convert a voltage to a raw DAC code.
    ///
    /// Values outside the range saturate at 0 or [`maxdata`](Self::maxdata).
    pub fn to_raw(&self, voltage: f64) -> u16 {
        let maxdata = f64::from(self.maxdata());
        let fraction = (voltage - self.min) / self.span();
        (fraction * maxdata).round().clamp(0.0, maxdata) as u16
    }

    /// Convert a raw DAC code back to volts.
    pub fn to_volts(&self, raw: u16) -> f64 {
        let fraction = f64::from(raw) / f64::from(self.maxdata());
        self.min + fraction * self.span()
    }

    /// Human-readable description of the range.
    pub fn description(&self) -> String {
        format!("{:.3} to {:.3} V", self.min, self.max)
    }
}

/// Kind of an input scan channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputChannelKind {
    /// Differential analog input, scaled to volts
    Analog,
    /// Digital port read as an integer value
    Digital,
    /// Counter channel read as a count
    Counter,
}

/// One entry of an input scan list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputChannel {
    /// Channel kind
    pub kind: InputChannelKind,
    /// Channel or port number
    pub channel: u32,
}

impl InputChannel {
    /// Analog input channel.
    pub fn analog(channel: u32) -> Self {
        Self {
            kind: InputChannelKind::Analog,
            channel,
        }
    }

    /// Digital port.
    pub fn digital(channel: u32) -> Self {
        Self {
            kind: InputChannelKind::Digital,
            channel,
        }
    }

    /// Counter channel.
    pub fn counter(channel: u32) -> Self {
        Self {
            kind: InputChannelKind::Counter,
            channel,
        }
    }
}

/// Edge that releases armed scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    /// Low to high
    Rising,
    /// High to low
    Falling,
}

/// External trigger wiring: a digital output line looped into the trigger input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Digital port carrying the trigger line
    pub port: u32,
    /// Bit within `port`
    pub bit: u32,
    /// Active edge
    pub edge: TriggerEdge,
}

impl TriggerConfig {
    /// Rising-edge trigger on `port`/`bit`.
    pub fn rising(port: u32, bit: u32) -> Self {
        Self {
            port,
            bit,
            edge: TriggerEdge::Rising,
        }
    }
}

/// Parameters of a background, externally triggered input scan.
#[derive(Debug, Clone, PartialEq)]
pub struct InputScanRequest {
    /// Ordered channel list; determines buffer interleaving
    pub channels: Vec<InputChannel>,
    /// Samples per second per channel
    pub rate: u32,
    /// Samples per channel
    pub points_per_channel: usize,
    /// Bipolar analog input range in volts
    pub range_volts: f64,
}

impl InputScanRequest {
    /// Total samples captured across all channels.
    pub fn total_count(&self) -> usize {
        self.channels.len() * self.points_per_channel
    }
}

/// Parameters of a background, externally triggered output scan.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputScanRequest {
    /// Ordered output channels; determines buffer interleaving
    pub channels: Vec<u32>,
    /// Range the buffer was scaled for
    pub range: OutputRange,
    /// Samples per second per channel
    pub rate: u32,
    /// Interleaved raw codes, frame-major
    pub buffer: Arc<[u16]>,
}

/// Hardware primitives the scan controller depends on.
pub trait DaqDriver: Send {
    /// Short driver name used in errors and logs.
    fn name(&self) -> &str;

    /// Probe whether the board is reachable.
    fn is_available(&mut self) -> DriverResult<bool>;

    /// First supported analog output range of the board.
    fn output_range(&mut self) -> DriverResult<OutputRange>;

    /// Configure the trigger line as an output driven low and arm the
    /// external trigger input on it.
    fn configure_trigger(&mut self, trigger: &TriggerConfig) -> DriverResult<()>;

    /// Drive one digital output bit.
    fn set_digital_bit(&mut self, port: u32, bit: u32, high: bool) -> DriverResult<()>;

    /// Arm a background input scan that waits for the external trigger.
    ///
    /// `buffer` must hold exactly `request.total_count()` samples.
    fn start_input_scan(&mut self, request: InputScanRequest, buffer: Vec<f64>)
        -> DriverResult<()>;

    /// Arm a background output scan that waits for the external trigger.
    fn start_output_scan(&mut self, request: OutputScanRequest) -> DriverResult<()>;

    /// Status of the background scan in `direction`.
    fn scan_status(&mut self, direction: ScanDirection) -> DriverResult<ScanStatus>;

    /// Hand back the capture buffer of a finished input scan.
    fn take_input_buffer(&mut self) -> DriverResult<Vec<f64>>;

    /// Stop the background scan in `direction`. No-op when idle.
    fn stop_background(&mut self, direction: ScanDirection) -> DriverResult<()>;
}
