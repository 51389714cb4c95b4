//! Clock-alignment state for the GPSDO-disciplined transmit clock
//!
//! The driver establishes a correspondence between UTC seconds and the
//! free-running DSP counter by sampling `pps_clks` at two consecutive PPS
//! edges. [`ClockTracker`] holds that correspondence and walks the
//! startup / normal / holdover states; reading the hardware and deciding
//! transitions is the driver's job.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// State of the transmit clock relative to the GPSDO PPS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    /// Waiting for GPSDO lock, no usable time mapping
    Startup,
    /// PPS present, time mapping valid
    Normal,
    /// PPS lost, free-running on the mapping captured in Normal
    Holdover,
}

impl ClockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockState::Startup => "startup",
            ClockState::Normal => "normal",
            ClockState::Holdover => "holdover",
        }
    }
}

/// Mapping between UTC and the DSP counter, plus holdover bookkeeping
#[derive(Debug)]
pub struct ClockTracker {
    pub state: ClockState,

    /// UTC second at which `clock_count_at_startup` was sampled
    pub utc_seconds_at_startup: u64,

    /// DSP counter value at that same PPS edge
    pub clock_count_at_startup: u64,

    /// Set on the Normal -> Holdover transition
    pub holdover_since: Option<Instant>,

    /// Same instant as UTC seconds, for the statistics map
    pub holdover_since_utc: u64,
}

impl ClockTracker {
    pub fn new() -> Self {
        Self {
            state: ClockState::Startup,
            utc_seconds_at_startup: 0,
            clock_count_at_startup: 0,
            holdover_since: None,
            holdover_since_utc: 0,
        }
    }

    /// Record a fresh UTC/counter correspondence and go Normal
    pub fn align(&mut self, utc_seconds: u64, clock_count: u64) {
        self.utc_seconds_at_startup = utc_seconds;
        self.clock_count_at_startup = clock_count;
        self.holdover_since = None;
        self.holdover_since_utc = 0;
        self.state = ClockState::Normal;
    }

    /// PPS lost while Normal
    pub fn enter_holdover(&mut self) {
        self.holdover_since = Some(Instant::now());
        self.holdover_since_utc = unix_seconds();
        self.state = ClockState::Holdover;
    }

    /// Drop the mapping and start over
    pub fn reset_to_startup(&mut self) {
        self.state = ClockState::Startup;
        self.utc_seconds_at_startup = 0;
        self.clock_count_at_startup = 0;
        self.holdover_since = None;
        self.holdover_since_utc = 0;
    }

    /// Time spent in holdover so far
    pub fn holdover_elapsed(&self) -> Option<Duration> {
        self.holdover_since.map(|since| since.elapsed())
    }

    /// Seconds of holdover tolerance left, 0 outside holdover
    pub fn remaining_holdover_s(&self, max_holdover: u64) -> u64 {
        match self.holdover_elapsed() {
            Some(elapsed) => max_holdover.saturating_sub(elapsed.as_secs()),
            None => 0,
        }
    }
}

impl Default for ClockTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Current UTC time as whole seconds
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Sleep until the host wall-clock second changes, then 200 ms more so the
/// PPS edge and the attribute latching have settled. Returns the second
/// that was entered.
pub fn wait_for_second_change() -> u64 {
    let start = unix_seconds();
    let mut now = start;
    while now == start {
        std::thread::sleep(Duration::from_millis(1));
        now = unix_seconds();
    }
    std::thread::sleep(Duration::from_millis(200));
    now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_goes_normal() {
        let mut tracker = ClockTracker::new();
        assert_eq!(tracker.state, ClockState::Startup);

        tracker.align(1_700_000_000, 163_840_000_000);
        assert_eq!(tracker.state, ClockState::Normal);
        assert_eq!(tracker.utc_seconds_at_startup, 1_700_000_000);
        assert_eq!(tracker.clock_count_at_startup, 163_840_000_000);
        assert!(tracker.holdover_since.is_none());
    }

    #[test]
    fn test_holdover_bookkeeping() {
        let mut tracker = ClockTracker::new();
        tracker.align(100, 200);

        tracker.enter_holdover();
        assert_eq!(tracker.state, ClockState::Holdover);
        assert!(tracker.holdover_since.is_some());
        assert!(tracker.holdover_since_utc > 0);
        assert!(tracker.remaining_holdover_s(600) <= 600);

        tracker.reset_to_startup();
        assert_eq!(tracker.state, ClockState::Startup);
        assert_eq!(tracker.utc_seconds_at_startup, 0);
        assert_eq!(tracker.clock_count_at_startup, 0);
        assert_eq!(tracker.remaining_holdover_s(600), 0);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ClockState::Startup.as_str(), "startup");
        assert_eq!(ClockState::Normal.as_str(), "normal");
        assert_eq!(ClockState::Holdover.as_str(), "holdover");
    }
}
