//! Radio device capability trait

use crate::error::Result;
use crate::types::{FrameData, RunStatistics};

/// Capability interface implemented by every transmitter backend.
///
/// The output stage programs against `dyn SdrDevice`; one concrete driver
/// (the DEXTER board, a simulated device) is selected at startup. All
/// methods take `&self`: a driver is shared between the transmitter worker
/// and the remote-control path and is responsible for its own interior
/// locking.
pub trait SdrDevice: Send + Sync {
    // =========================================================================
    // Device Information
    // =========================================================================

    /// Short name of the backend, used in logs and the RC surface
    fn device_name(&self) -> &'static str;

    /// Board temperature in degrees Celsius, if the device can measure it
    fn get_temperature(&self) -> Option<f64>;

    /// Snapshot of the device run statistics (underruns, late frames,
    /// clock state, health sensors)
    fn get_run_statistics(&self) -> RunStatistics;

    // =========================================================================
    // RF Control
    // =========================================================================

    /// Retune the transmitter. `lo_offset` is applied in the DSP,
    /// `frequency` at the upconverter. Failures are logged and ignored.
    fn tune(&self, lo_offset: i64, frequency: u64);

    /// Read back the configured transmission frequency in Hz
    fn get_tx_freq(&self) -> u64;

    /// Set the transmit gain. Failures are logged and ignored; on success
    /// the cached configuration is updated from the hardware read-back.
    fn set_txgain(&self, gain: f64);

    /// Read back the transmit gain
    fn get_txgain(&self) -> f64;

    /// Set the receive gain of the DPD feedback path
    fn set_rxgain(&self, _gain: f64) {}

    /// Read back the receive gain of the DPD feedback path
    fn get_rxgain(&self) -> f64 {
        0.0
    }

    /// Set the analog front-end bandwidth. No-op for devices without
    /// RF filter control.
    fn set_bandwidth(&self, _bandwidth: u64) {}

    /// Read back the analog front-end bandwidth
    fn get_bandwidth(&self) -> u64 {
        0
    }

    // =========================================================================
    // Clock
    // =========================================================================

    /// Current device wall-clock in fractional UTC seconds. Returns `0.0`
    /// while the device clock is not yet aligned.
    fn get_real_secs(&self) -> Result<f64>;

    /// Check the transmit clock source and, when synchronous transmission
    /// is enabled, drive the clock state machine one tick. Returns `true`
    /// iff the device is ready to schedule timestamped frames.
    fn is_clk_source_ok(&self) -> Result<bool>;

    // =========================================================================
    // Transmission
    // =========================================================================

    /// Signal that the next frame hand-off must re-arm hardware scheduling,
    /// because the upstream timestamp offset changed or the host detected
    /// a late or inconsistent timestamp.
    fn require_timestamp_refresh(&self);

    /// Hand one transmission frame to the hardware. Does not return until
    /// the frame is in the hardware FIFO or was deliberately dropped;
    /// drops are accounted as late or underrun in the statistics.
    fn transmit_frame(&self, frame: FrameData) -> Result<()>;
}
