//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report everything that can go wrong between the operator, the syringe pump
//! and the spectrometer.
//!
//! ## Error Hierarchy
//!
//! - **Validation** (`InvalidPort`, `InvalidVolume`, `InvalidSpeed`,
//!   `OutOfRangeInterval`): rejected before any command reaches hardware. The
//!   message carries the offending value and the accepted range.
//! - **`IllegalTransition`**: an instrument session operation that is
//!   structurally invalid in the current state (e.g. starting a second
//!   experiment). Harmless repeats such as pausing twice are not errors.
//! - **`HardwareComm`**: serial or OPC UA round-trip failure. Never retried
//!   locally; the orchestrator tears down and re-raises.
//! - **`DuplicateExperiment`**: the destination already holds spectra.
//! - **`Aborted`**: the operator answered `Exit` at a prompt.
//! - **`Config` / `Configuration`**: figment load failures and semantic
//!   validation failures respectively.
//! - **`ShutdownFailed`**: teardown errors collected after an otherwise
//!   successful run.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid port {port}: valve has positions 1-{valve_count}")]
    InvalidPort { port: u8, valve_count: u8 },

    #[error("Invalid volume {volume_ml} mL: expected 0-{max_ml} mL")]
    InvalidVolume { volume_ml: f64, max_ml: f64 },

    #[error("Invalid speed {speed_ml_s} mL/s: expected >0 and <= {max_ml_s} mL/s")]
    InvalidSpeed { speed_ml_s: f64, max_ml_s: f64 },

    #[error("Sampling interval {seconds} s is not in range {min}-{max} s")]
    OutOfRangeInterval { seconds: u32, min: u32, max: u32 },

    #[error("Cannot {operation} while session is {state}")]
    IllegalTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Hardware communication error: {0}")]
    HardwareComm(String),

    #[error("Spectra for this experiment already exist at {}", .0.display())]
    DuplicateExperiment(PathBuf),

    #[error("Run aborted by operator: {0}")]
    Aborted(String),

    #[error("Instrument returned unexpected value for {node}: {detail}")]
    UnexpectedValue { node: String, detail: String },

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Shorthand for transport-level failures.
    pub fn comm(message: impl Into<String>) -> Self {
        DaqError::HardwareComm(message.into())
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::comm("pump timed out");
        assert_eq!(
            err.to_string(),
            "Hardware communication error: pump timed out"
        );
    }

    #[test]
    fn test_interval_error_names_value_and_range() {
        let err = DaqError::OutOfRangeInterval {
            seconds: 3601,
            min: 15,
            max: 3600,
        };
        let msg = err.to_string();
        assert!(msg.contains("3601"));
        assert!(msg.contains("15-3600"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::comm("opc disconnect"),
            DaqError::comm("serial close"),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
