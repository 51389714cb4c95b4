//! Simulated output device for development and testing
//!
//! Stands in for real transmitter hardware: frames are accepted, length
//! checked and recorded instead of radiated. The device clock is a plain
//! settable value so tests can position frames relative to it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SdrDeviceConfig;
use crate::error::{Result, SdrError};
use crate::traits::SdrDevice;
use crate::types::{FrameData, FrameTimestamp, RunStatistics, StatValue};

/// Simulated transmitter backend
pub struct SimulatedSdr {
    config: Arc<Mutex<SdrDeviceConfig>>,
    device_time: Mutex<f64>,
    transmitted: Mutex<Vec<FrameTimestamp>>,
    clk_source_ok: AtomicBool,
    refresh_requested: AtomicBool,
    num_frames: AtomicU64,
    num_late: AtomicU64,
    num_underflows: AtomicU64,
}

impl SimulatedSdr {
    pub fn new(config: Arc<Mutex<SdrDeviceConfig>>) -> Self {
        Self {
            config,
            device_time: Mutex::new(0.0),
            transmitted: Mutex::new(Vec::new()),
            clk_source_ok: AtomicBool::new(true),
            refresh_requested: AtomicBool::new(false),
            num_frames: AtomicU64::new(0),
            num_late: AtomicU64::new(0),
            num_underflows: AtomicU64::new(0),
        }
    }

    /// Position the simulated device clock
    pub fn set_device_time(&self, secs: f64) {
        *self.device_time.lock().unwrap() = secs;
    }

    /// Make `is_clk_source_ok` report the given state
    pub fn set_clk_source_ok(&self, ok: bool) {
        self.clk_source_ok.store(ok, Ordering::SeqCst);
    }

    /// Timestamps of all frames handed to the device so far
    pub fn transmitted(&self) -> Vec<FrameTimestamp> {
        self.transmitted.lock().unwrap().clone()
    }

    /// Whether a timestamp refresh was requested since the last call
    pub fn take_refresh_requested(&self) -> bool {
        self.refresh_requested.swap(false, Ordering::SeqCst)
    }
}

impl SdrDevice for SimulatedSdr {
    fn device_name(&self) -> &'static str {
        "Simulated"
    }

    fn get_temperature(&self) -> Option<f64> {
        Some(35.0)
    }

    fn get_run_statistics(&self) -> RunStatistics {
        let mut rs = RunStatistics::new();
        rs.insert(
            "underruns".into(),
            StatValue::Uint(self.num_underflows.load(Ordering::SeqCst)),
        );
        rs.insert(
            "latepackets".into(),
            StatValue::Uint(self.num_late.load(Ordering::SeqCst)),
        );
        rs.insert(
            "frames".into(),
            StatValue::Uint(self.num_frames.load(Ordering::SeqCst)),
        );
        rs
    }

    fn tune(&self, lo_offset: i64, frequency: u64) {
        let mut config = self.config.lock().unwrap();
        config.lo_offset = lo_offset;
        config.frequency = frequency;
    }

    fn get_tx_freq(&self) -> u64 {
        self.config.lock().unwrap().frequency
    }

    fn set_txgain(&self, gain: f64) {
        self.config.lock().unwrap().txgain = gain;
    }

    fn get_txgain(&self) -> f64 {
        self.config.lock().unwrap().txgain
    }

    fn set_rxgain(&self, gain: f64) {
        self.config.lock().unwrap().rxgain = gain;
    }

    fn get_rxgain(&self) -> f64 {
        self.config.lock().unwrap().rxgain
    }

    fn get_real_secs(&self) -> Result<f64> {
        Ok(*self.device_time.lock().unwrap())
    }

    fn is_clk_source_ok(&self) -> Result<bool> {
        Ok(self.clk_source_ok.load(Ordering::SeqCst))
    }

    fn require_timestamp_refresh(&self) {
        self.refresh_requested.store(true, Ordering::SeqCst);
    }

    fn transmit_frame(&self, frame: FrameData) -> Result<()> {
        let expected = {
            let config = self.config.lock().unwrap();
            config.dab_mode.transmission_frame_len_samples() * 2
        };
        if frame.buf.len() != expected {
            return Err(SdrError::InvalidFrameLength {
                expected,
                actual: frame.buf.len(),
            });
        }

        self.transmitted.lock().unwrap().push(frame.ts);
        self.num_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DabMode;

    fn make_sim() -> SimulatedSdr {
        SimulatedSdr::new(Arc::new(Mutex::new(SdrDeviceConfig::default())))
    }

    #[test]
    fn test_transmit_checks_length() {
        let sim = make_sim();
        let frame = FrameData {
            buf: vec![0u8; 100],
            sample_size: 4,
            ts: FrameTimestamp::default(),
        };
        assert!(matches!(
            sim.transmit_frame(frame),
            Err(SdrError::InvalidFrameLength { .. })
        ));

        let frame = FrameData {
            buf: vec![0u8; DabMode::One.transmission_frame_len_samples() * 2],
            sample_size: 4,
            ts: FrameTimestamp::default(),
        };
        sim.transmit_frame(frame).unwrap();
        assert_eq!(sim.transmitted().len(), 1);
    }

    #[test]
    fn test_tune_updates_config() {
        let sim = make_sim();
        sim.tune(10_000, 222_064_000);
        assert_eq!(sim.get_tx_freq(), 222_064_000);
    }
}
