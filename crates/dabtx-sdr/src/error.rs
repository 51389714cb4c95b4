//! Error types for the SDR output core

use std::io;
use thiserror::Error;

/// Result type for SDR output operations
pub type Result<T> = std::result::Result<T, SdrError>;

/// Errors that can occur in the output stage or a device driver
#[derive(Error, Debug)]
pub enum SdrError {
    /// A required IIO device was not found on the bus
    #[error("IIO device not found: {0}")]
    DeviceNotFound(String),

    /// Filesystem-level failure while talking to the bus
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to read a hardware attribute
    #[error("failed to read {device}.{attr}: {reason}")]
    AttrRead {
        device: &'static str,
        attr: &'static str,
        reason: String,
    },

    /// Failed to write a hardware attribute
    #[error("failed to write {device}.{attr} = {value}: {reason}")]
    AttrWrite {
        device: &'static str,
        attr: &'static str,
        value: i64,
        reason: String,
    },

    /// The device only supports a fixed sample rate
    #[error("unsupported sample rate {actual} Hz, device requires {required} Hz")]
    UnsupportedSampleRate { required: u64, actual: u64 },

    /// PPS and DSP clocks are inconsistent
    #[error("clock alignment failed: pps_clks advanced by {observed}, expected {expected}")]
    ClockAlignment { expected: u64, observed: u64 },

    /// A frame buffer does not have the exact transmission-frame length
    #[error("invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    /// A frame timestamp lies so far in the future that transmission
    /// cannot meaningfully continue
    #[error("timestamp {offset:.3} s in the future, aborting output")]
    TimestampAbort { offset: f64 },

    /// The transmitter worker thread has terminated
    #[error("SDR worker thread is not running")]
    WorkerDead,

    /// The DPD feedback server thread has terminated
    #[error("DPD feedback server is not running")]
    FeedbackServerDead,

    /// Remote-control parameter failure
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

/// Error raised by the remote-control surface for unknown, read-only
/// or unparseable parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParameterError(pub String);

impl ParameterError {
    /// Unknown or read-only parameter on the named controllable
    pub fn not_exported(parameter: &str, controllable: &str) -> Self {
        ParameterError(format!(
            "Parameter '{}' is read-only or not exported by controllable {}",
            parameter, controllable
        ))
    }

    /// Value could not be parsed for the parameter
    pub fn bad_value(parameter: &str, value: &str) -> Self {
        ParameterError(format!(
            "Cannot parse '{}' for parameter '{}'",
            value, parameter
        ))
    }
}
