//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the scan controller.
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. config/scan.toml file (optional)
//! 3. Environment variables (prefixed with SCAN_DAQ_, sections split on `__`)
//!
//! # Example
//! ```no_run
//! use scan_daq::config::ScanConfig;
//!
//! let config = ScanConfig::load()?;
//! println!("Base topic: {}", config.transport.base_topic);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/scan.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Message transport settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Board wiring
    #[serde(default)]
    pub board: BoardConfig,
    /// Loop periods and trigger timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Simulated board parameters
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scan-daq".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

/// Message transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Root of every control and status topic
    pub base_topic: String,
    /// Broker host name
    pub broker_host: String,
    /// Client identifier presented to the broker
    pub client_id: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_topic: "scan".to_string(),
            broker_host: "localhost".to_string(),
            client_id: "scan-daq".to_string(),
        }
    }
}

/// Board wiring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board number as known to the driver
    pub board_num: u32,
    /// Digital port carrying the trigger line
    pub trigger_port: u32,
    /// Bit of `trigger_port` wired to the external trigger input
    pub trigger_bit: u32,
    /// Full-scale input range in volts (bipolar)
    pub input_range_volts: f64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            board_num: 0,
            trigger_port: 0,
            trigger_bit: 0,
            input_range_volts: 10.0,
        }
    }
}

/// Loop periods and trigger pulse timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Completion monitor poll period
    pub poll_interval_ms: u64,
    /// Device availability heartbeat period
    pub availability_interval_ms: u64,
    /// Settle delay between arming and the trigger pulse
    pub trigger_settle_ms: u64,
    /// Trigger pulse width
    pub trigger_pulse_ms: u64,
    /// Controller command queue capacity
    pub command_queue: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            availability_interval_ms: 10_000,
            trigger_settle_ms: 100,
            trigger_pulse_ms: 10,
            command_queue: 32,
        }
    }
}

impl TimingConfig {
    /// Completion monitor poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Availability heartbeat period.
    pub fn availability_interval(&self) -> Duration {
        Duration::from_millis(self.availability_interval_ms)
    }

    /// Settle delay before the trigger pulse.
    pub fn trigger_settle(&self) -> Duration {
        Duration::from_millis(self.trigger_settle_ms)
    }

    /// Trigger pulse width.
    pub fn trigger_pulse(&self) -> Duration {
        Duration::from_millis(self.trigger_pulse_ms)
    }
}

/// Parameters of the in-process simulated board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Lower bound of the first supported output range (volts)
    pub output_range_min: f64,
    /// Upper bound of the first supported output range (volts)
    pub output_range_max: f64,
    /// DAC resolution in bits
    pub resolution_bits: u32,
    /// Whether the board answers availability probes
    pub available: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            output_range_min: -10.0,
            output_range_max: 10.0,
            resolution_bits: 16,
            available: true,
        }
    }
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl ScanConfig {
    /// Load configuration from config/scan.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix SCAN_DAQ_
    /// Example: SCAN_DAQ_TRANSPORT__BASE_TOPIC=lab/scan
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The layered provider used by [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCAN_DAQ_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        let base = &self.transport.base_topic;
        if base.is_empty() || base.ends_with('/') || base.contains(['+', '#']) {
            return Err(format!(
                "Invalid base_topic '{}'. Must be non-empty, without wildcards or trailing '/'",
                base
            ));
        }

        if self.timing.poll_interval_ms == 0 || self.timing.availability_interval_ms == 0 {
            return Err("Loop intervals must be greater than zero".to_string());
        }

        if self.timing.command_queue == 0 {
            return Err("command_queue must be greater than zero".to_string());
        }

        if !(1..=16).contains(&self.simulation.resolution_bits) {
            return Err(format!(
                "Invalid resolution_bits {}. Must be 1-16",
                self.simulation.resolution_bits
            ));
        }

        if self.simulation.output_range_min >= self.simulation.output_range_max {
            return Err(format!(
                "Invalid output range {} to {}",
                self.simulation.output_range_min, self.simulation.output_range_max
            ));
        }

        if self.board.input_range_volts <= 0.0 {
            return Err("input_range_volts must be positive".to_string());
        }

        Ok(())
    }
}
