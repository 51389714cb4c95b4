//! Frame, timestamp and statistics types shared by the output stage and
//! the device drivers

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Rate of the sub-second timestamp counter carried in ETI metadata, in Hz.
///
/// `FrameTimestamp::timestamp_pps` counts ticks of this clock.
pub const TIMESTAMP_PPS_RATE: u64 = 16_384_000;

/// DAB transmission mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DabMode {
    One,
    Two,
    Three,
    Four,
}

impl DabMode {
    /// Parse the numeric mode from configuration (1..=4)
    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            1 => Some(DabMode::One),
            2 => Some(DabMode::Two),
            3 => Some(DabMode::Three),
            4 => Some(DabMode::Four),
            _ => None,
        }
    }

    /// Duration of one transmission frame
    pub fn transmission_frame_duration(&self) -> Duration {
        match self {
            DabMode::One => Duration::from_millis(96),
            DabMode::Two => Duration::from_millis(24),
            DabMode::Three => Duration::from_millis(24),
            DabMode::Four => Duration::from_millis(48),
        }
    }

    /// Length of one transmission frame at 2.048 MS/s, counted in
    /// interleaved I/Q `i16` values (twice the number of complex samples)
    pub fn transmission_frame_len_samples(&self) -> usize {
        match self {
            DabMode::One => (2656 + 76 * 2552) * 2,
            DabMode::Two => (664 + 76 * 638) * 2,
            DabMode::Three => (345 + 153 * 319) * 2,
            DabMode::Four => (1328 + 76 * 1276) * 2,
        }
    }
}

/// Broadcast timestamp of a transmission frame, derived from the ETI
/// MNSC and TIST fields
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTimestamp {
    /// Frame-count token, identifies the frame in logs
    pub fct: u32,

    /// Whether a full timestamp was received for this frame
    pub timestamp_valid: bool,

    /// UTC seconds of the frame's first sample
    pub timestamp_sec: u32,

    /// Sub-second offset, in ticks of [`TIMESTAMP_PPS_RATE`]
    pub timestamp_pps: u32,

    /// The upstream timestamp offset was changed; scheduling state
    /// derived from earlier frames must be flushed
    pub offset_changed: bool,
}

impl FrameTimestamp {
    /// Timestamp as fractional UTC seconds
    pub fn get_real_secs(&self) -> f64 {
        self.timestamp_sec as f64 + self.timestamp_pps as f64 / TIMESTAMP_PPS_RATE as f64
    }

    /// Offset of this timestamp relative to the host clock, in seconds.
    /// Positive means the timestamp lies in the future.
    pub fn offset_to_system_time(&self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        self.get_real_secs() - now.as_secs_f64()
    }
}

/// One transmission frame ready to hand over to the transmitter
#[derive(Debug, Clone, Default)]
pub struct FrameData {
    /// Interleaved 16-bit signed I/Q pairs, native byte order
    pub buf: Vec<u8>,

    /// Bytes per complex sample (4 for int16 I/Q)
    pub sample_size: usize,

    /// Broadcast timestamp of the first sample
    pub ts: FrameTimestamp,
}

/// Metadata accompanying one call to the output stage. In transmission
/// modes where several ETI frames build one transmission frame, one entry
/// is passed per contributing ETI frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameMetadata {
    pub ts: FrameTimestamp,
}

/// A single run-statistics value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatValue {
    Text(String),
    Float(f64),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Null,
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Text(s) => write!(f, "{}", s),
            StatValue::Float(v) => write!(f, "{:.6}", v),
            StatValue::Int(v) => write!(f, "{}", v),
            StatValue::Uint(v) => write!(f, "{}", v),
            StatValue::Bool(v) => write!(f, "{}", if *v { 1 } else { 0 }),
            StatValue::Null => Ok(()),
        }
    }
}

impl From<&str> for StatValue {
    fn from(v: &str) -> Self {
        StatValue::Text(v.to_string())
    }
}

impl From<f64> for StatValue {
    fn from(v: f64) -> Self {
        StatValue::Float(v)
    }
}

impl From<i64> for StatValue {
    fn from(v: i64) -> Self {
        StatValue::Int(v)
    }
}

impl From<u64> for StatValue {
    fn from(v: u64) -> Self {
        StatValue::Uint(v)
    }
}

impl From<bool> for StatValue {
    fn from(v: bool) -> Self {
        StatValue::Bool(v)
    }
}

/// Device run statistics, keyed by stable names exposed over remote control
pub type RunStatistics = BTreeMap<String, StatValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_one_frame_length() {
        // 96 ms at 2.048 MS/s, interleaved I and Q
        assert_eq!(DabMode::One.transmission_frame_len_samples(), 393_216);
        assert_eq!(
            DabMode::One.transmission_frame_duration(),
            Duration::from_millis(96)
        );
    }

    #[test]
    fn test_all_modes_are_96ms_multiples() {
        for mode in [DabMode::One, DabMode::Two, DabMode::Three, DabMode::Four] {
            let samps = mode.transmission_frame_len_samples() as u128 / 2;
            let dur = mode.transmission_frame_duration().as_millis();
            // complex samples = duration * 2.048 MS/s
            assert_eq!(samps, dur * 2_048_000 / 1000);
        }
    }

    #[test]
    fn test_real_secs() {
        let ts = FrameTimestamp {
            fct: 0,
            timestamp_valid: true,
            timestamp_sec: 1000,
            timestamp_pps: TIMESTAMP_PPS_RATE as u32 / 2,
            offset_changed: false,
        };
        assert!((ts.get_real_secs() - 1000.5).abs() < 1e-9);
    }

    #[test]
    fn test_stat_value_display() {
        assert_eq!(StatValue::Bool(true).to_string(), "1");
        assert_eq!(StatValue::Bool(false).to_string(), "0");
        assert_eq!(StatValue::Null.to_string(), "");
        assert_eq!(StatValue::Uint(42).to_string(), "42");
        assert_eq!(StatValue::Text("normal".into()).to_string(), "normal");
    }
}
