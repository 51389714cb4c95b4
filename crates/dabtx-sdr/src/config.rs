//! Output device configuration

use serde::{Deserialize, Serialize};

use crate::types::DabMode;

/// Configuration for an SDR output device.
///
/// `muting`, `enable_sync`, `txgain` and `max_gps_holdover_time` are
/// live-settable through the remote-control surface; the rest is fixed
/// at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdrDeviceConfig {
    /// Baseband sample rate in Hz
    pub sample_rate: u64,

    /// Transmission centre frequency in Hz
    pub frequency: u64,

    /// Local-oscillator offset applied in the DSP, in Hz
    pub lo_offset: i64,

    /// Transmit gain, device units
    pub txgain: f64,

    /// Receive gain for the DPD feedback path, device units
    pub rxgain: f64,

    /// Analog front-end bandwidth in Hz (0 = device default)
    pub bandwidth: u64,

    /// Mute the output by stopping the transmitter
    pub muting: bool,

    /// Transmit synchronously to the frame timestamps
    pub enable_sync: bool,

    /// Mute frames that carry no usable timestamp
    pub mute_no_timestamps: bool,

    /// DAB transmission mode
    pub dab_mode: DabMode,

    /// Maximum GPS holdover duration in seconds before the clock state
    /// machine falls back to startup
    pub max_gps_holdover_time: u64,

    /// TCP port of the DPD feedback server, 0 to disable
    pub dpd_feedback_server_port: u16,
}

impl Default for SdrDeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 2_048_000,
            frequency: 222_064_000, // 11D
            lo_offset: 0,
            txgain: 0.0,
            rxgain: 0.0,
            bandwidth: 0,
            muting: false,
            enable_sync: false,
            mute_no_timestamps: false,
            dab_mode: DabMode::One,
            max_gps_holdover_time: 600,
            dpd_feedback_server_port: 0,
        }
    }
}

impl SdrDeviceConfig {
    /// Builder: set the transmission frequency
    pub fn with_frequency(mut self, hz: u64) -> Self {
        self.frequency = hz;
        self
    }

    /// Builder: set the transmit gain
    pub fn with_txgain(mut self, gain: f64) -> Self {
        self.txgain = gain;
        self
    }

    /// Builder: enable synchronous (timestamped) transmission
    pub fn with_sync(mut self, enable: bool) -> Self {
        self.enable_sync = enable;
        self
    }

    /// Builder: set the DAB transmission mode
    pub fn with_dab_mode(mut self, mode: DabMode) -> Self {
        self.dab_mode = mode;
        self
    }

    /// Builder: set the maximum GPS holdover duration
    pub fn with_max_gps_holdover_time(mut self, seconds: u64) -> Self {
        self.max_gps_holdover_time = seconds;
        self
    }

    /// Builder: set the DPD feedback server port
    pub fn with_dpd_feedback_server_port(mut self, port: u16) -> Self {
        self.dpd_feedback_server_port = port;
        self
    }
}
