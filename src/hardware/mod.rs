//! Hardware access for triggered scans.
//!
//! - [`driver`] - the [`DaqDriver`] primitives and their value types
//! - [`handle`] - [`DriverHandle`], the single task that owns and serializes the driver
//! - [`simulated`] - [`SimulatedBoard`], an in-process board for tests and dry runs

pub mod driver;
pub mod handle;
pub mod simulated;

pub use driver::{
    DaqDriver, InputChannel, InputChannelKind, InputScanRequest, OutputRange, OutputScanRequest,
    ScanDirection, ScanStatus, TriggerConfig, TriggerEdge,
};
pub use handle::DriverHandle;
pub use simulated::{DriverCall, Primitive, SimulatedBoard};
