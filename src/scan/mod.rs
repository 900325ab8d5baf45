//! Triggered scan sessions.
//!
//! - [`waveform`] - interleaved output buffer staging
//! - [`result`] - capture buffer de-interleaving
//! - [`session`] - `init` validation and the session state machine
//! - [`controller`] - the actor that owns the session and runs commands
//! - [`completion`] - poll loop reporting scan completion to the controller
//! - [`availability`] - periodic device availability heartbeat

pub mod availability;
pub mod completion;
pub mod controller;
pub mod result;
pub mod session;
pub mod waveform;

pub use availability::AvailabilityMonitor;
pub use completion::{CompletionMonitor, MonitorEvent, MonitorEventKind};
pub use controller::{ControllerCommand, ControllerHandle, ScanController, SessionInfo};
pub use result::assemble_result;
pub use session::{InitRequest, ScanSession, ScanState};
pub use waveform::{build_output_buffer, OutputWaveform, OUTPUT_CHANNEL_COUNT};
