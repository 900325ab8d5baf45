//! # Scan DAQ
//!
//! Remote-controlled, hardware-triggered waveform output and synchronized
//! acquisition on a multifunction DAQ board.
//!
//! A supervisor sends `init`, `start` and `abort` commands over a publish/subscribe
//! transport. The controller stages two analog output waveforms and an input scan
//! list, arms both background scans against an external trigger, pulses the
//! trigger line from a digital output, and publishes the captured samples once
//! the input scan completes. A heartbeat publishes device availability alongside.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered configuration (defaults, TOML file, environment) via figment.
//! - **`error`**: `DriverError` for hardware primitives and `ScanError` for everything
//!   reported to the supervisor.
//! - **`logging`**: tracing subscriber setup.
//! - **`hardware`**: The `DaqDriver` primitives, the task that owns the driver, and a
//!   simulated board.
//! - **`transport`**: The `Transport` trait with in-memory and stdin/stdout backends.
//! - **`protocol`**: Topics, payload types, command decoding and typed publishing.
//! - **`scan`**: Session validation, buffer staging, the controller actor and the
//!   background monitors.
//! - **`server`**: Wires everything together and runs the command dispatch loop.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod protocol;
pub mod scan;
pub mod server;
pub mod transport;

pub use config::ScanConfig;
pub use error::{DriverError, DriverErrorKind, ScanError, ScanResult};
pub use server::ScanServer;
