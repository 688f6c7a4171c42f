//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report everything that can go wrong during a coil test, from a device that
//! stops answering to an operator asking for more current than the bench allows.
//!
//! ## Error Hierarchy
//!
//! - **`TransportTimeout`**: no response within the device's configured timeout,
//!   including a bounded operation-complete wait that never saw `1`.
//! - **`InstrumentError`**: the device reported a non-zero code in its error queue
//!   after a command. Carries the SCPI error text.
//! - **`ParseError`**: a response that should have been numeric was not.
//! - **`SafetyLimitExceeded`** / **`NotArmed`**: requests rejected locally. These never
//!   reach the device.
//! - **`ReadbackMismatch`**: a programmed ramp value did not read back identically,
//!   so arming was abandoned.
//! - **`SinkWriteFailure`**: the log or time-series sink could not take a record.
//!
//! None of these are retried by the library; callers decide whether to skip a
//! sample, abandon a ramp, or stop the run.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Logical identity of an instrument on the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Nanovoltmeter on the serial link.
    Voltmeter,
    /// Programmable power supply driving the coil.
    Supply,
    /// Multi-channel analog digitizer.
    Digitizer,
    /// Optional temperature monitor.
    Thermometer,
}

impl Device {
    /// Name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Voltmeter => "voltmeter",
            Device::Supply => "supply",
            Device::Digitizer => "digitizer",
            Device::Thermometer => "thermometer",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("{device}: no response to '{operation}' within timeout")]
    TransportTimeout { device: Device, operation: String },

    #[error("{device}: instrument error {code}: {message}")]
    InstrumentError {
        device: Device,
        code: i32,
        message: String,
    },

    #[error("{device}: could not parse response '{response}'")]
    ParseError { device: Device, response: String },

    #[error("Requested {quantity} {requested} is not below the ceiling of {ceiling}")]
    SafetyLimitExceeded {
        quantity: &'static str,
        requested: f64,
        ceiling: f64,
    },

    #[error("No ramp is armed; run planRamp first")]
    NotArmed,

    #[error("{device}: {parameter} read back as {read}, wrote {written}")]
    ReadbackMismatch {
        device: Device,
        parameter: &'static str,
        written: String,
        read: String,
    },

    #[error("Sink '{sink}' write failed: {reason}")]
    SinkWriteFailure { sink: String, reason: String },

    #[error("{device}: transport error: {reason}")]
    Transport { device: Device, reason: String },

    #[error("{device}: session is closed")]
    SessionClosed { device: Device },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Shutdown failed with errors: {0:?}")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Instrument this error originated from, when there is one.
    pub fn device(&self) -> Option<Device> {
        match self {
            DaqError::TransportTimeout { device, .. }
            | DaqError::InstrumentError { device, .. }
            | DaqError::ParseError { device, .. }
            | DaqError::ReadbackMismatch { device, .. }
            | DaqError::Transport { device, .. }
            | DaqError::SessionClosed { device } => Some(*device),
            _ => None,
        }
    }

    /// True for requests rejected before anything was sent to hardware.
    pub fn is_local_rejection(&self) -> bool {
        matches!(
            self,
            DaqError::SafetyLimitExceeded { .. }
                | DaqError::NotArmed
                | DaqError::UnknownCommand(_)
                | DaqError::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::InstrumentError {
            device: Device::Supply,
            code: -222,
            message: "Data out of range".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "supply: instrument error -222: Data out of range"
        );
        assert_eq!(err.device(), Some(Device::Supply));
    }

    #[test]
    fn test_local_rejections() {
        let err = DaqError::SafetyLimitExceeded {
            quantity: "current",
            requested: 600.0,
            ceiling: 550.0,
        };
        assert!(err.is_local_rejection());
        assert!(err.device().is_none());
        assert!(!DaqError::SessionClosed {
            device: Device::Voltmeter
        }
        .is_local_rejection());
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Transport {
                device: Device::Voltmeter,
                reason: "port vanished".into(),
            },
            DaqError::SessionClosed {
                device: Device::Supply,
            },
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
