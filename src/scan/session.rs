//! Scan session: validated parameters, staged buffers and lifecycle state.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ScanError, ScanResult};
use crate::hardware::{
    InputChannel, InputChannelKind, InputScanRequest, OutputRange, OutputScanRequest,
};

use super::waveform::{build_output_buffer, OutputWaveform, OUTPUT_CHANNEL_COUNT};

/// Lifecycle state of the scan session.
///
/// ```text
/// UNINITIALIZED --init--> INITIALIZED --start--> RUNNING --idle--> COMPLETE
///                                                   |
///             abort (any state) --> ABORTED      fault --> ERROR
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    /// No session yet
    Uninitialized,
    /// Buffers built, ready to start
    Initialized,
    /// Armed and triggered, waiting for completion
    Running,
    /// Result published
    Complete,
    /// Stopped by `abort`
    Aborted,
    /// Arming, status check or result collection failed
    Error,
}

impl ScanState {
    /// Whether a background scan may be active on the board.
    pub fn is_running(&self) -> bool {
        matches!(self, ScanState::Running)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Uninitialized => "UNINITIALIZED",
            ScanState::Initialized => "INITIALIZED",
            ScanState::Running => "RUNNING",
            ScanState::Complete => "COMPLETE",
            ScanState::Aborted => "ABORTED",
            ScanState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Validated `init` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InitRequest {
    /// Samples per second per channel
    pub rate: u32,
    /// Output waveforms, ascending by channel number
    pub waveforms: Vec<OutputWaveform>,
    /// Ordered input scan list
    pub input_channels: Vec<InputChannel>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TypedChannel {
    #[serde(rename = "type")]
    kind: InputChannelKind,
    channel: u32,
}

impl InitRequest {
    /// Parse and validate an `init` payload.
    ///
    /// Errors name the offending field, e.g. `rate` or `dac_waveforms.1[3]`.
    pub fn from_json(payload: &Value) -> ScanResult<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| ScanError::validation("payload", "expected a JSON object"))?;

        let rate = parse_rate(required(object, "rate")?)?;
        let waveforms = parse_waveforms(required(object, "dac_waveforms")?)?;
        let input_channels = parse_input_channels(required(object, "adc_channels")?)?;

        Ok(Self {
            rate,
            waveforms,
            input_channels,
        })
    }

    /// Points per channel, shared by every waveform.
    pub fn points_per_channel(&self) -> usize {
        self.waveforms.first().map_or(0, |w| w.samples.len())
    }
}

fn required<'a>(object: &'a Map<String, Value>, field: &str) -> ScanResult<&'a Value> {
    object
        .get(field)
        .ok_or_else(|| ScanError::validation(field, "missing required field"))
}

fn parse_rate(value: &Value) -> ScanResult<u32> {
    let Value::Number(number) = value else {
        return Err(ScanError::validation("rate", "must be an integer"));
    };
    if let Some(rate) = number.as_u64() {
        if rate == 0 {
            return Err(ScanError::validation("rate", "must be greater than zero"));
        }
        return u32::try_from(rate)
            .map_err(|_| ScanError::validation("rate", format!("{} is out of range", rate)));
    }
    if number.as_i64().is_some() {
        return Err(ScanError::validation("rate", "must be greater than zero"));
    }
    Err(ScanError::validation("rate", "must be an integer"))
}

fn parse_waveforms(value: &Value) -> ScanResult<Vec<OutputWaveform>> {
    let object = value.as_object().ok_or_else(|| {
        ScanError::validation("dac_waveforms", "expected an object of channel -> samples")
    })?;

    if object.len() != OUTPUT_CHANNEL_COUNT {
        return Err(ScanError::validation(
            "dac_waveforms",
            format!(
                "exactly {} DAC channels are required (got {})",
                OUTPUT_CHANNEL_COUNT,
                object.len()
            ),
        ));
    }

    let mut seen = BTreeSet::new();
    let mut waveforms = Vec::with_capacity(object.len());
    for (key, samples) in object {
        let field = format!("dac_waveforms.{}", key);
        let channel: u32 = key
            .trim()
            .parse()
            .map_err(|_| ScanError::validation(&field, "channel must be a non-negative integer"))?;
        if !seen.insert(channel) {
            return Err(ScanError::validation(&field, "duplicate channel"));
        }

        let samples = samples
            .as_array()
            .ok_or_else(|| ScanError::validation(&field, "expected an array of numbers"))?
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_f64().ok_or_else(|| {
                    ScanError::validation(format!("{}[{}]", field, i), "must be a number")
                })
            })
            .collect::<ScanResult<Vec<f64>>>()?;

        if samples.is_empty() {
            return Err(ScanError::validation(&field, "waveform must not be empty"));
        }
        waveforms.push(OutputWaveform::new(channel, samples));
    }

    waveforms.sort_by_key(|w| w.channel);

    let points = waveforms[0].samples.len();
    if let Some(odd) = waveforms.iter().find(|w| w.samples.len() != points) {
        return Err(ScanError::validation(
            "dac_waveforms",
            format!(
                "waveforms must have equal length (channel {} has {} points, channel {} has {})",
                waveforms[0].channel,
                points,
                odd.channel,
                odd.samples.len()
            ),
        ));
    }

    Ok(waveforms)
}

fn parse_input_channels(value: &Value) -> ScanResult<Vec<InputChannel>> {
    let entries = value
        .as_array()
        .ok_or_else(|| ScanError::validation("adc_channels", "expected an array of channels"))?;
    if entries.is_empty() {
        return Err(ScanError::validation(
            "adc_channels",
            "at least one input channel is required",
        ));
    }

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let field = format!("adc_channels[{}]", i);
            match entry {
                Value::Number(n) => n
                    .as_u64()
                    .and_then(|c| u32::try_from(c).ok())
                    .map(InputChannel::analog)
                    .ok_or_else(|| {
                        ScanError::validation(&field, "channel must be a non-negative integer")
                    }),
                Value::Object(_) => TypedChannel::deserialize(entry)
                    .map(|typed| InputChannel {
                        kind: typed.kind,
                        channel: typed.channel,
                    })
                    .map_err(|e| ScanError::validation(&field, e.to_string())),
                _ => Err(ScanError::validation(
                    &field,
                    "expected a channel number or {\"type\", \"channel\"} object",
                )),
            }
        })
        .collect()
}

/// One configured scan.
///
/// Owns the staged output buffer and, between `start` and completion, lends the
/// capture buffer to the driver.
#[derive(Debug)]
pub struct ScanSession {
    id: u64,
    rate: u32,
    points_per_channel: usize,
    output_channels: Vec<u32>,
    input_channels: Vec<InputChannel>,
    output_range: OutputRange,
    output_buffer: Arc<[u16]>,
    input_buffer: Option<Vec<f64>>,
    state: ScanState,
}

impl ScanSession {
    /// Stage buffers for `request` against the board's output range.
    pub fn new(id: u64, request: InitRequest, output_range: OutputRange) -> ScanResult<Self> {
        let output_buffer = build_output_buffer(&request.waveforms, &output_range)?;
        let points_per_channel = request.points_per_channel();
        let input_buffer = vec![0.0; points_per_channel * request.input_channels.len()];

        Ok(Self {
            id,
            rate: request.rate,
            points_per_channel,
            output_channels: request.waveforms.iter().map(|w| w.channel).collect(),
            input_channels: request.input_channels,
            output_range,
            output_buffer: output_buffer.into(),
            input_buffer: Some(input_buffer),
            state: ScanState::Initialized,
        })
    }

    /// Unique, increasing session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ScanState) {
        self.state = state;
    }

    /// Samples per second per channel.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Waveform length shared by every output channel.
    pub fn points_per_channel(&self) -> usize {
        self.points_per_channel
    }

    /// Output channel ids in ascending order.
    pub fn output_channels(&self) -> &[u32] {
        &self.output_channels
    }

    /// Input channels in request order.
    pub fn input_channels(&self) -> &[InputChannel] {
        &self.input_channels
    }

    /// Range the output buffer was scaled for.
    pub fn output_range(&self) -> OutputRange {
        self.output_range
    }

    /// Interleaved raw output codes.
    pub fn output_buffer(&self) -> Arc<[u16]> {
        Arc::clone(&self.output_buffer)
    }

    /// Samples the capture buffer holds.
    pub fn input_buffer_len(&self) -> usize {
        self.points_per_channel * self.input_channels.len()
    }

    /// Last capture returned by the driver, if any.
    pub fn input_buffer(&self) -> Option<&[f64]> {
        self.input_buffer.as_deref()
    }

    /// Lend the capture buffer out for an input scan.
    pub(crate) fn take_input_buffer(&mut self) -> Vec<f64> {
        self.input_buffer
            .take()
            .unwrap_or_else(|| vec![0.0; self.input_buffer_len()])
    }

    pub(crate) fn store_input_buffer(&mut self, buffer: Vec<f64>) {
        self.input_buffer = Some(buffer);
    }

    /// Input scan parameters for this session.
    pub fn input_request(&self, range_volts: f64) -> InputScanRequest {
        InputScanRequest {
            channels: self.input_channels.clone(),
            rate: self.rate,
            points_per_channel: self.points_per_channel,
            range_volts,
        }
    }

    /// Output scan parameters for this session.
    pub fn output_request(&self) -> OutputScanRequest {
        OutputScanRequest {
            channels: self.output_channels.clone(),
            range: self.output_range,
            rate: self.rate,
            buffer: self.output_buffer(),
        }
    }
}
