//! Error types for the scan controller.
//!
//! This module defines the primary error type, `ScanError`, and the driver-level
//! `DriverError` it wraps. Using the `thiserror` crate, it provides one place to
//! describe every failure the controller can report on the error topic.
//!
//! ## Error Hierarchy
//!
//! `ScanError` consolidates the failure sources of a scan session:
//!
//! - **`Validation`**: A malformed or out-of-range `init` payload. Carries the name of
//!   the offending field so the supervisor can fix the request.
//! - **`InvalidState`**: A command that is not accepted in the current session state
//!   (for example `start` before `init`). Reported in the validation class.
//! - **`Driver`**: Wraps a [`DriverError`] raised by a hardware primitive while arming,
//!   triggering, polling or stopping a scan.
//! - **`Protocol`**: An inbound payload that is not valid JSON or not UTF-8.
//! - **`Transport`**: The message transport refused a publish or subscribe.
//! - **`ControllerUnavailable`**: The controller task has stopped and can no longer
//!   accept commands.
//!
//! None of these are fatal to the command-processing path. They are caught at the
//! handler boundary and published as `{"error": "..."}` messages.

use std::fmt;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad category of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Board could not be opened or set up
    Initialization,
    /// Rejected parameters (range, channel list, buffer size)
    Configuration,
    /// Lost contact with the board or its driver task
    Communication,
    /// Board reported a failure while running
    Hardware,
    /// Operation did not finish in time
    Timeout,
    /// Anything else
    Unknown,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by a [`DaqDriver`](crate::hardware::DaqDriver) primitive.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver}' {kind} error: {message}")]
pub struct DriverError {
    /// Name of the driver that failed
    pub driver: String,
    /// Failure category
    pub kind: DriverErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl DriverError {
    /// Error from `driver` of the given kind.
    pub fn new(
        driver: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Result alias for driver primitives.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

// =============================================================================
// Scan Errors
// =============================================================================

/// Convenience alias for results using the controller error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Error class as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad command payload
    Validation,
    /// Hardware primitive failed
    Driver,
    /// Command not valid now, or malformed message
    Protocol,
    /// Broker connection problem
    Transport,
}

/// Primary error type of the scan controller.
#[derive(Error, Debug)]
pub enum ScanError {
    /// A session parameter failed validation.
    #[error("invalid field '{field}': {message}")]
    Validation { field: String, message: String },

    /// The command is not accepted in the current session state.
    #[error("'{command}' is not allowed while the session is {state}")]
    InvalidState {
        command: &'static str,
        state: crate::scan::ScanState,
    },

    /// A hardware primitive failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// An inbound payload could not be decoded.
    #[error("{0}")]
    Protocol(String),

    /// The message transport rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// The controller task is gone.
    #[error("scan controller is not running")]
    ControllerUnavailable,
}

impl ScanError {
    /// Build a validation error for `field`.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The class this error is reported under.
    pub fn class(&self) -> ErrorClass {
        match self {
            ScanError::Validation { .. } | ScanError::InvalidState { .. } => {
                ErrorClass::Validation
            }
            ScanError::Driver(_) => ErrorClass::Driver,
            ScanError::Protocol(_) => ErrorClass::Protocol,
            ScanError::Transport(_) | ScanError::ControllerUnavailable => ErrorClass::Transport,
        }
    }

    /// Name of the offending field for validation errors.
    pub fn field(&self) -> Option<&str> {
        match self {
            ScanError::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Protocol(format!("Invalid JSON: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanState;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::new("simulated", DriverErrorKind::Hardware, "scan overrun");
        assert_eq!(
            err.to_string(),
            "Driver 'simulated' hardware error: scan overrun"
        );
    }

    #[test]
    fn test_validation_error_names_field() {
        let err = ScanError::validation("rate", "must be a positive integer");
        assert_eq!(err.field(), Some("rate"));
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.to_string().contains("rate"));
    }

    #[test]
    fn test_invalid_state_is_validation_class() {
        let err = ScanError::InvalidState {
            command: "start",
            state: ScanState::Uninitialized,
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.to_string().contains("UNINITIALIZED"));
    }

    #[test]
    fn test_driver_error_converts() {
        let err: ScanError = DriverError::new("sim", DriverErrorKind::Timeout, "no response").into();
        assert_eq!(err.class(), ErrorClass::Driver);
        assert!(err.to_string().contains("no response"));
    }
}
