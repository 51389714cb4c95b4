//! PrecisionWave DEXTER board driver
//!
//! The board carries a GPSDO-disciplined FPGA DSP (`dexter_dsp_tx`), an
//! AD9957 upconverter and a sample sink with a double-buffered DMA ring.
//! Frames are radiated at their broadcast timestamp by arming
//! `stream0_start_clks` with the DSP counter value of the frame's first
//! sample; the mapping between UTC and the DSP counter is established from
//! the PPS edge and survives PPS loss for a bounded holdover window.

pub mod clock;
pub mod health;
pub mod iio;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::SdrDeviceConfig;
use crate::error::{Result, SdrError};
use crate::traits::SdrDevice;
use crate::types::{FrameData, RunStatistics, StatValue, TIMESTAMP_PPS_RATE};

use clock::{ClockState, ClockTracker};
use iio::{IioBus, LocalIio, DSP_TX, SAMPLE_SINK, UPCONVERTER};

/// DSP counter rate: 80 clocks per sample at 2.048 MS/s
pub const DSP_CLOCK: u64 = 2_048_000 * 80;

/// `timestamp_pps` is in 16.384 MHz ticks, the DSP counter runs 10x faster
const TIMESTAMP_PPS_PER_DSP_CLOCKS: u64 = DSP_CLOCK / TIMESTAMP_PPS_RATE;

/// The board transmits mode 1 frames only
const REQUIRED_SAMPLE_RATE: u64 = 2_048_000;

/// One transmission frame in interleaved I/Q `i16` values (mode 1)
const TRANSMISSION_FRAME_LEN_SAMPS: usize = (2656 + 76 * 2552) * 2;

/// The DMA ring holds two half-frame blocks
const IIO_BUFFERS: usize = 2;
const IIO_BUFFER_LEN_SAMPS: usize = TRANSMISSION_FRAME_LEN_SAMPS / IIO_BUFFERS;

const IIO_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames must reach the hardware with at least this much margin
const MIN_HANDOFF_MARGIN_S: f64 = 0.2;

/// Driver for the DEXTER transmitter board
pub struct Dexter {
    config: Arc<Mutex<SdrDeviceConfig>>,
    bus: Mutex<Box<dyn IioBus>>,
    clock: Mutex<ClockTracker>,

    channel_is_up: AtomicBool,
    require_refresh: AtomicBool,

    /// Written by the poller thread, read here and by the statistics path
    underflows: Arc<Mutex<u64>>,
    prev_underflows: AtomicU64,

    num_late: AtomicU64,
    num_frames_modulated: AtomicU64,
    num_buffers_pushed: AtomicU64,

    running: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,

    hwmon_root: PathBuf,
    iio_root: PathBuf,
}

impl Dexter {
    /// Locate the board on the local IIO bus and initialise it.
    ///
    /// The underflow poller gets its own independent context so its
    /// once-a-second reads never contend with the transmit path.
    pub fn new(config: Arc<Mutex<SdrDeviceConfig>>) -> Result<Self> {
        let bus = Box::new(LocalIio::open()?);
        let poller_bus = Box::new(LocalIio::open()?);
        Self::with_bus(
            config,
            bus,
            poller_bus,
            Path::new(health::HWMON_ROOT),
            Path::new(health::IIO_ROOT),
        )
    }

    fn with_bus(
        config: Arc<Mutex<SdrDeviceConfig>>,
        mut bus: Box<dyn IioBus>,
        poller_bus: Box<dyn IioBus>,
        hwmon_root: &Path,
        iio_root: &Path,
    ) -> Result<Self> {
        tracing::info!("creating DEXTER device");

        bus.set_timeout(IIO_TIMEOUT);

        for device in [DSP_TX, UPCONVERTER, SAMPLE_SINK] {
            if !bus.has_device(device) {
                return Err(SdrError::DeviceNotFound(device.to_string()));
            }
        }

        bus.attr_write(DSP_TX, "dc0", 0)?;
        bus.attr_write(DSP_TX, "dc1", 0)?;

        let (sample_rate, lo_offset, frequency, txgain) = {
            let config = config.lock().unwrap();
            (
                config.sample_rate,
                config.lo_offset,
                config.frequency,
                config.txgain,
            )
        };

        if sample_rate != REQUIRED_SAMPLE_RATE {
            return Err(SdrError::UnsupportedSampleRate {
                required: REQUIRED_SAMPLE_RATE,
                actual: sample_rate,
            });
        }

        tune_on(bus.as_mut(), lo_offset, frequency);
        tracing::info!("DEXTER tuned to {:.3} kHz", frequency as f64 / 1000.0);

        // The FIFO should not contain data, but zeroing the gain before
        // clearing start_clks keeps the flush from emitting anything.
        bus.attr_write(DSP_TX, "gain0", 0)?;
        bus.attr_write(DSP_TX, "stream0_flush_fifo_trigger", 1)?;
        bus.attr_write(DSP_TX, "stream0_start_clks", 0)?;

        bus.enable_channel(SAMPLE_SINK)?;
        bus.create_buffer(SAMPLE_SINK, IIO_BUFFER_LEN_SAMPS)?;

        // Flush the FPGA FIFO with one zeroed block
        let zeroes = vec![0u8; IIO_BUFFER_LEN_SAMPS * 2];
        let pushed = bus.push_block(&zeroes);
        if pushed < 0 {
            tracing::error!("DEXTER init buffer push failed ({})", pushed);
        }
        std::thread::sleep(Duration::from_millis(200));

        write_attr_logged(bus.as_mut(), DSP_TX, "gain0", txgain as i64);

        let underflows = Arc::new(Mutex::new(0u64));
        let running = Arc::new(AtomicBool::new(true));

        let poller = {
            let underflows = Arc::clone(&underflows);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("dexter-underflow".to_string())
                .spawn(move || underflow_read_process(poller_bus, underflows, running))?
        };

        Ok(Self {
            config,
            bus: Mutex::new(bus),
            clock: Mutex::new(ClockTracker::new()),
            channel_is_up: AtomicBool::new(false),
            require_refresh: AtomicBool::new(false),
            underflows,
            prev_underflows: AtomicU64::new(0),
            num_late: AtomicU64::new(0),
            num_frames_modulated: AtomicU64::new(0),
            num_buffers_pushed: AtomicU64::new(0),
            running,
            poller: Some(poller),
            hwmon_root: hwmon_root.to_path_buf(),
            iio_root: iio_root.to_path_buf(),
        })
    }

    fn channel_up(&self, bus: &mut dyn IioBus) {
        let txgain = self.config.lock().unwrap().txgain;
        write_attr_logged(bus, DSP_TX, "gain0", txgain as i64);
        self.channel_is_up.store(true, Ordering::SeqCst);
        tracing::debug!("DEXTER channel up");
    }

    fn channel_down(&self, bus: &mut dyn IioBus) {
        write_attr_logged(bus, DSP_TX, "gain0", 0);
        // This also flushes out the FIFO
        write_attr_logged(bus, DSP_TX, "stream0_start_clks", 0);
        self.channel_is_up.store(false, Ordering::SeqCst);
        tracing::debug!("DEXTER channel down");
    }

    /// One tick of the clock state machine.
    ///
    /// Startup: once the GPSDO is locked and PPS present, sample `pps_clks`
    /// at two consecutive second changes, check the increment equals one
    /// second of DSP clocks and record the UTC/counter correspondence.
    /// Normal: fall into holdover on PPS loss. Holdover: after the
    /// configured tolerance, or as soon as PPS returns, drop the mapping
    /// and realign from scratch.
    fn handle_hw_time(&self, bus: &mut dyn IioBus) -> Result<()> {
        let mut clock = self.clock.lock().unwrap();

        match clock.state {
            ClockState::Startup => {
                let gpsdo_locked = bus.attr_read(DSP_TX, "gpsdo_locked")?;
                let pps_loss = bus.attr_read(DSP_TX, "pps_loss_of_signal")?;

                if gpsdo_locked == 1 && pps_loss == 0 {
                    tracing::info!("DEXTER waiting for second change");
                    clock::wait_for_second_change();
                    let pps_clks_first = bus.attr_read(DSP_TX, "pps_clks")? as u64;
                    tracing::info!("DEXTER pps_clks {}", pps_clks_first);

                    let second = clock::wait_for_second_change();
                    let pps_clks_second = bus.attr_read(DSP_TX, "pps_clks")? as u64;
                    tracing::info!(
                        "DEXTER pps_clks increased by {}",
                        pps_clks_second.wrapping_sub(pps_clks_first)
                    );

                    if pps_clks_first + DSP_CLOCK != pps_clks_second {
                        return Err(SdrError::ClockAlignment {
                            expected: DSP_CLOCK,
                            observed: pps_clks_second.wrapping_sub(pps_clks_first),
                        });
                    }

                    clock.align(second, pps_clks_second);
                    tracing::debug!("DEXTER clock state Startup -> Normal");
                }
            }
            ClockState::Normal => {
                let pps_loss = bus.attr_read(DSP_TX, "pps_loss_of_signal")?;
                if pps_loss == 1 {
                    clock.enter_holdover();
                    tracing::debug!("DEXTER clock state Normal -> Holdover");
                }
            }
            ClockState::Holdover => {
                let pps_loss = bus.attr_read(DSP_TX, "pps_loss_of_signal")?;
                let max_holdover =
                    Duration::from_secs(self.config.lock().unwrap().max_gps_holdover_time);

                let expired = clock
                    .holdover_elapsed()
                    .map(|elapsed| elapsed > max_holdover)
                    .unwrap_or(true);

                // A returning PPS also goes through Startup: the board
                // realigns rather than trusting the held-over mapping.
                if expired || pps_loss == 0 {
                    clock.reset_to_startup();
                    tracing::debug!("DEXTER clock state Holdover -> Startup");
                }
            }
        }
        Ok(())
    }
}

impl SdrDevice for Dexter {
    fn device_name(&self) -> &'static str {
        "Dexter"
    }

    fn get_temperature(&self) -> Option<f64> {
        health::read_baseboard_temperature(&self.hwmon_root)
    }

    fn get_run_statistics(&self) -> RunStatistics {
        let mut rs = RunStatistics::new();

        rs.insert(
            "underruns".into(),
            StatValue::Uint(*self.underflows.lock().unwrap()),
        );
        rs.insert(
            "latepackets".into(),
            StatValue::Uint(self.num_late.load(Ordering::SeqCst)),
        );
        rs.insert(
            "frames".into(),
            StatValue::Uint(self.num_frames_modulated.load(Ordering::SeqCst)),
        );

        {
            let mut bus = self.bus.lock().unwrap();
            attr_to_stat(&mut rs, bus.as_mut(), "clks", "clks");
            attr_to_stat(
                &mut rs,
                bus.as_mut(),
                "stream0_fifo_not_empty_clks",
                "fifo_not_empty_clks",
            );
            attr_to_stat(&mut rs, bus.as_mut(), "gpsdo_locked", "gpsdo_locked");
            attr_to_stat(&mut rs, bus.as_mut(), "pps_clk_error_hz", "pps_clk_error_hz");
            attr_to_stat(&mut rs, bus.as_mut(), "pps_cnt", "pps_cnt");
            attr_to_stat(
                &mut rs,
                bus.as_mut(),
                "pps_loss_of_signal",
                "pps_loss_of_signal",
            );
            attr_to_stat(&mut rs, bus.as_mut(), "dsp_version", "dsp_version");
        }

        {
            let clock = self.clock.lock().unwrap();
            rs.insert(
                "clock_state".into(),
                StatValue::Text(clock.state.as_str().to_string()),
            );
            rs.insert(
                "in_holdover_since".into(),
                StatValue::Uint(clock.holdover_since_utc),
            );
            let max_holdover = self.config.lock().unwrap().max_gps_holdover_time;
            rs.insert(
                "remaining_holdover_s".into(),
                StatValue::Uint(clock.remaining_holdover_s(max_holdover)),
            );
        }

        let board = health::read_board_health(&self.hwmon_root, &self.iio_root);
        for (name, volts) in &board.rails {
            rs.insert((*name).into(), StatValue::Float(*volts));
        }
        rs.insert(
            "tempfpga".into(),
            StatValue::Float(board.temp_fpga.unwrap_or(-1.0)),
        );
        rs.insert("voltage_alarm".into(), StatValue::Bool(board.voltage_alarm));
        rs.insert("temp_alarm".into(), StatValue::Bool(board.temp_alarm));

        rs
    }

    fn tune(&self, lo_offset: i64, frequency: u64) {
        let mut bus = self.bus.lock().unwrap();
        tune_on(bus.as_mut(), lo_offset, frequency);
    }

    fn get_tx_freq(&self) -> u64 {
        let mut bus = self.bus.lock().unwrap();

        let lo_offset = match bus.attr_read(DSP_TX, "frequency0") {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("{}", e);
                return 0;
            }
        };
        let frequency = match bus.attr_read(UPCONVERTER, "center_frequency") {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("{}", e);
                return 0;
            }
        };
        (frequency + lo_offset).max(0) as u64
    }

    fn set_txgain(&self, gain: f64) {
        let mut bus = self.bus.lock().unwrap();
        write_attr_logged(bus.as_mut(), DSP_TX, "gain0", gain as i64);

        match bus.attr_read(DSP_TX, "gain0") {
            Ok(readback) => {
                self.config.lock().unwrap().txgain = readback as f64;
            }
            Err(e) => tracing::warn!("{}", e),
        }
    }

    fn get_txgain(&self) -> f64 {
        let mut bus = self.bus.lock().unwrap();
        match bus.attr_read(DSP_TX, "gain0") {
            Ok(v) => v as f64,
            Err(e) => {
                tracing::warn!("{}", e);
                0.0
            }
        }
    }

    fn get_real_secs(&self) -> Result<f64> {
        let clks = self.bus.lock().unwrap().attr_read(DSP_TX, "clks")?;
        let clock = self.clock.lock().unwrap();
        Ok(match clock.state {
            ClockState::Startup => 0.0,
            ClockState::Normal | ClockState::Holdover => {
                clock.utc_seconds_at_startup as f64
                    + (clks as f64 - clock.clock_count_at_startup as f64) / DSP_CLOCK as f64
            }
        })
    }

    fn is_clk_source_ok(&self) -> Result<bool> {
        if self.config.lock().unwrap().enable_sync {
            {
                let mut bus = self.bus.lock().unwrap();
                self.handle_hw_time(bus.as_mut())?;
            }
            Ok(self.clock.lock().unwrap().state != ClockState::Startup)
        } else {
            Ok(true)
        }
    }

    fn require_timestamp_refresh(&self) {
        self.require_refresh.store(true, Ordering::SeqCst);
    }

    fn transmit_frame(&self, frame: FrameData) -> Result<()> {
        const FRAME_LEN_BYTES: usize = TRANSMISSION_FRAME_LEN_SAMPS * 2;
        if frame.buf.len() != FRAME_LEN_BYTES {
            tracing::debug!(
                "DEXTER transmit_frame expected {} bytes, got {}",
                FRAME_LEN_BYTES,
                frame.buf.len()
            );
            return Err(SdrError::InvalidFrameLength {
                expected: FRAME_LEN_BYTES,
                actual: frame.buf.len(),
            });
        }

        let require_timestamped_tx =
            self.config.lock().unwrap().enable_sync && frame.ts.timestamp_valid;

        let mut bus = self.bus.lock().unwrap();

        if !self.channel_is_up.load(Ordering::SeqCst) {
            if require_timestamped_tx {
                let (state, utc_at_startup, count_at_startup) = {
                    let clock = self.clock.lock().unwrap();
                    (
                        clock.state,
                        clock.utc_seconds_at_startup,
                        clock.clock_count_at_startup,
                    )
                };

                if state == ClockState::Startup {
                    return Ok(()); // not ready
                }

                let frame_start_clocks = (frame.ts.timestamp_sec as i64 - utc_at_startup as i64)
                    * DSP_CLOCK as i64
                    + count_at_startup as i64
                    + (frame.ts.timestamp_pps as u64 * TIMESTAMP_PPS_PER_DSP_CLOCKS) as i64;

                let margin_s = frame.ts.offset_to_system_time();
                let clks = bus.attr_read(DSP_TX, "clks")?;
                let margin_device_s = (frame_start_clocks - clks) as f64 / DSP_CLOCK as f64;

                tracing::debug!(
                    "DEXTER FCT {} start clks {} margin {:.3} / {:.3}",
                    frame.ts.fct,
                    frame_start_clocks,
                    margin_s,
                    margin_device_s
                );

                if margin_s < MIN_HANDOFF_MARGIN_S {
                    tracing::warn!("skip frame, short margin {:.3}", margin_s);
                    self.num_late.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }

                if let Err(e) = bus.attr_write(DSP_TX, "stream0_start_clks", frame_start_clocks) {
                    tracing::warn!("skip frame: {}", e);
                    self.num_late.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                self.require_refresh.store(false, Ordering::SeqCst);
            }

            self.channel_up(bus.as_mut());
        }

        if self.require_refresh.swap(false, Ordering::SeqCst) {
            tracing::debug!("DEXTER timestamp refresh, rearming");
            self.channel_down(bus.as_mut());
        }

        if self.channel_is_up.load(Ordering::SeqCst) {
            const BLOCK_LEN_BYTES: usize = IIO_BUFFER_LEN_SAMPS * 2;
            for block in frame.buf.chunks_exact(BLOCK_LEN_BYTES).take(IIO_BUFFERS) {
                let pushed = bus.push_block(block);
                if pushed < 0 {
                    tracing::error!(
                        "DEXTER failed to push buffer ({}) after {} blocks",
                        pushed,
                        self.num_buffers_pushed.load(Ordering::SeqCst)
                    );
                    self.num_buffers_pushed.store(0, Ordering::SeqCst);
                    self.channel_down(bus.as_mut());
                    break;
                }
                self.num_buffers_pushed.fetch_add(1, Ordering::SeqCst);
            }
            self.num_frames_modulated.fetch_add(1, Ordering::SeqCst);
        }

        let underflows = *self.underflows.lock().unwrap();
        let prev = self.prev_underflows.swap(underflows, Ordering::SeqCst);
        if underflows != 0 && underflows != prev {
            tracing::warn!("DEXTER underflow! {} -> {}", prev, underflows);
        }

        Ok(())
    }
}

impl Drop for Dexter {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }

        let mut bus = self.bus.lock().unwrap();
        write_attr_logged(bus.as_mut(), DSP_TX, "gain0", 0);
        bus.destroy_buffer();
        bus.disable_channel(SAMPLE_SINK);
    }
}

/// Retune: `lo_offset` goes to the DSP, `frequency` to the upconverter.
/// Failures are logged and ignored.
fn tune_on(bus: &mut dyn IioBus, lo_offset: i64, frequency: u64) {
    write_attr_logged(bus, UPCONVERTER, "center_frequency", frequency as i64);
    write_attr_logged(bus, DSP_TX, "frequency0", lo_offset);
}

fn write_attr_logged(bus: &mut dyn IioBus, device: &'static str, attr: &'static str, value: i64) {
    if let Err(e) = bus.attr_write(device, attr, value) {
        tracing::warn!("{}", e);
    }
}

fn attr_to_stat(
    rs: &mut RunStatistics,
    bus: &mut dyn IioBus,
    attr: &'static str,
    stat_name: &str,
) {
    match bus.attr_read(DSP_TX, attr) {
        Ok(value) => {
            rs.insert(stat_name.to_string(), StatValue::Int(value));
        }
        Err(e) => {
            rs.insert(stat_name.to_string(), StatValue::Int(-1));
            tracing::error!("{}", e);
        }
    }
}

/// Poll `buffer_underflows0` once a second on a dedicated context and
/// publish increases under the shared mutex. Pure observer.
fn underflow_read_process(
    mut bus: Box<dyn IioBus>,
    underflows: Arc<Mutex<u64>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));

        if let Ok(value) = bus.attr_read(DSP_TX, "buffer_underflows0") {
            let value = value as u64;
            let mut stored = underflows.lock().unwrap();
            if value != *stored && value != 0 {
                *stored = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameTimestamp;
    use std::collections::BTreeMap;

    /// Scripted attribute bus shared with the test through Arc'd state
    #[derive(Clone, Default)]
    struct MockState {
        attrs: Arc<Mutex<BTreeMap<(&'static str, &'static str), i64>>>,
        writes: Arc<Mutex<Vec<(&'static str, &'static str, i64)>>>,
        pushed_blocks: Arc<Mutex<Vec<usize>>>,
        push_result: Arc<Mutex<Option<isize>>>,
        /// pps_clks advances by one second of DSP clocks per read
        pps_clks_step: Arc<Mutex<i64>>,
    }

    impl MockState {
        fn set_attr(&self, device: &'static str, attr: &'static str, value: i64) {
            self.attrs.lock().unwrap().insert((device, attr), value);
        }

        fn writes_to(&self, attr: &str) -> Vec<i64> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, a, _)| *a == attr)
                .map(|(_, _, v)| *v)
                .collect()
        }
    }

    struct MockBus {
        state: MockState,
    }

    impl MockBus {
        fn new(state: MockState) -> Self {
            let defaults = [
                (DSP_TX, "gpsdo_locked", 0),
                (DSP_TX, "pps_loss_of_signal", 0),
                (DSP_TX, "pps_clks", 0),
                (DSP_TX, "clks", 0),
                (DSP_TX, "buffer_underflows0", 0),
                (DSP_TX, "gain0", 0),
            ];
            {
                let mut attrs = state.attrs.lock().unwrap();
                for (device, attr, value) in defaults {
                    attrs.entry((device, attr)).or_insert(value);
                }
            }
            Self { state }
        }
    }

    impl IioBus for MockBus {
        fn set_timeout(&mut self, _timeout: Duration) {}

        fn has_device(&self, device: &'static str) -> bool {
            matches!(device, DSP_TX | UPCONVERTER | SAMPLE_SINK)
        }

        fn attr_read(&mut self, device: &'static str, attr: &'static str) -> Result<i64> {
            let mut attrs = self.state.attrs.lock().unwrap();
            let value = *attrs.get(&(device, attr)).ok_or(SdrError::AttrRead {
                device,
                attr,
                reason: "not scripted".to_string(),
            })?;

            if attr == "pps_clks" {
                let step = *self.state.pps_clks_step.lock().unwrap();
                attrs.insert((device, attr), value + step);
            }
            Ok(value)
        }

        fn attr_write(
            &mut self,
            device: &'static str,
            attr: &'static str,
            value: i64,
        ) -> Result<()> {
            self.state
                .writes
                .lock()
                .unwrap()
                .push((device, attr, value));
            self.state.attrs.lock().unwrap().insert((device, attr), value);
            Ok(())
        }

        fn enable_channel(&mut self, _device: &'static str) -> Result<()> {
            Ok(())
        }

        fn disable_channel(&mut self, _device: &'static str) {}

        fn create_buffer(&mut self, _device: &'static str, _len_samples: usize) -> Result<()> {
            Ok(())
        }

        fn destroy_buffer(&mut self) {}

        fn push_block(&mut self, data: &[u8]) -> isize {
            if let Some(forced) = *self.state.push_result.lock().unwrap() {
                return forced;
            }
            self.state.pushed_blocks.lock().unwrap().push(data.len());
            data.len() as isize
        }
    }

    fn make_dexter(config: SdrDeviceConfig) -> (MockState, Dexter) {
        let state = MockState::default();
        let bus = Box::new(MockBus::new(state.clone()));
        let poller_bus = Box::new(MockBus::new(state.clone()));
        let tmp = std::env::temp_dir();

        let dexter = Dexter::with_bus(
            Arc::new(Mutex::new(config)),
            bus,
            poller_bus,
            &tmp,
            &tmp,
        )
        .unwrap();
        (state, dexter)
    }

    fn full_frame(ts: FrameTimestamp) -> FrameData {
        FrameData {
            buf: vec![0u8; TRANSMISSION_FRAME_LEN_SAMPS * 2],
            sample_size: 4,
            ts,
        }
    }

    #[test]
    fn test_construction_writes_init_sequence() {
        let config = SdrDeviceConfig::default().with_txgain(60.0);
        let (state, dexter) = make_dexter(config);

        let writes = state.writes.lock().unwrap().clone();
        let names: Vec<&str> = writes.iter().map(|(_, attr, _)| *attr).collect();

        assert!(names.contains(&"dc0"));
        assert!(names.contains(&"dc1"));
        assert!(names.contains(&"stream0_flush_fifo_trigger"));

        // gain is zeroed before start_clks is cleared
        let gain_zero = writes
            .iter()
            .position(|w| *w == (DSP_TX, "gain0", 0))
            .unwrap();
        let clear_start = writes
            .iter()
            .position(|w| *w == (DSP_TX, "stream0_start_clks", 0))
            .unwrap();
        assert!(gain_zero < clear_start);

        // gain raised to the configured value at the end
        assert_eq!(state.writes_to("gain0").last(), Some(&60));

        // one zeroed flush block was pushed
        assert_eq!(
            state.pushed_blocks.lock().unwrap().as_slice(),
            &[IIO_BUFFER_LEN_SAMPS * 2]
        );

        drop(dexter);
    }

    #[test]
    fn test_wrong_sample_rate_fails_construction() {
        let mut config = SdrDeviceConfig::default();
        config.sample_rate = 1_000_000;

        let state = MockState::default();
        let result = Dexter::with_bus(
            Arc::new(Mutex::new(config)),
            Box::new(MockBus::new(state.clone())),
            Box::new(MockBus::new(state)),
            &std::env::temp_dir(),
            &std::env::temp_dir(),
        );
        assert!(matches!(
            result,
            Err(SdrError::UnsupportedSampleRate { .. })
        ));
    }

    #[test]
    fn test_unsync_frame_brings_channel_up_and_pushes() {
        let (state, dexter) = make_dexter(SdrDeviceConfig::default().with_txgain(42.0));
        state.pushed_blocks.lock().unwrap().clear();

        dexter
            .transmit_frame(full_frame(FrameTimestamp::default()))
            .unwrap();

        assert!(dexter.channel_is_up.load(Ordering::SeqCst));
        assert_eq!(
            state.pushed_blocks.lock().unwrap().as_slice(),
            &[IIO_BUFFER_LEN_SAMPS * 2; 2]
        );
        assert_eq!(dexter.num_frames_modulated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_length_is_fatal() {
        let (_state, dexter) = make_dexter(SdrDeviceConfig::default());
        let frame = FrameData {
            buf: vec![0u8; 100],
            sample_size: 4,
            ts: FrameTimestamp::default(),
        };
        assert!(matches!(
            dexter.transmit_frame(frame),
            Err(SdrError::InvalidFrameLength { .. })
        ));
    }

    #[test]
    fn test_first_frame_arms_start_clks() {
        let config = SdrDeviceConfig::default().with_sync(true).with_txgain(50.0);
        let (state, dexter) = make_dexter(config);
        state.pushed_blocks.lock().unwrap().clear();

        // Clock aligned 10 s ago at counter value 1_000_000
        let now = clock::unix_seconds();
        let utc_at_startup = now - 10;
        let count_at_startup = 1_000_000u64;
        dexter
            .clock
            .lock()
            .unwrap()
            .align(utc_at_startup, count_at_startup);

        // Frame two seconds in the future, comfortably above the margin
        let ts = FrameTimestamp {
            fct: 12,
            timestamp_valid: true,
            timestamp_sec: (now + 2) as u32,
            timestamp_pps: 1_572_864,
            offset_changed: false,
        };
        dexter.transmit_frame(full_frame(ts)).unwrap();

        let expected = (ts.timestamp_sec as i64 - utc_at_startup as i64) * DSP_CLOCK as i64
            + count_at_startup as i64
            + ts.timestamp_pps as i64 * 10;

        let armed = state.writes_to("stream0_start_clks");
        assert_eq!(armed.last(), Some(&expected));

        assert!(dexter.channel_is_up.load(Ordering::SeqCst));
        assert_eq!(state.pushed_blocks.lock().unwrap().len(), 2);
        assert_eq!(dexter.num_late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_late_frame_is_dropped() {
        let config = SdrDeviceConfig::default().with_sync(true);
        let (state, dexter) = make_dexter(config);
        state.pushed_blocks.lock().unwrap().clear();

        let now = clock::unix_seconds();
        dexter.clock.lock().unwrap().align(now - 10, 1_000_000);

        // Margin is ~0.1 s at best, below the 200 ms floor
        let ts = FrameTimestamp {
            fct: 13,
            timestamp_valid: true,
            timestamp_sec: now as u32,
            timestamp_pps: 0,
            offset_changed: false,
        };
        dexter.transmit_frame(full_frame(ts)).unwrap();

        assert_eq!(dexter.num_late.load(Ordering::SeqCst), 1);
        assert!(!dexter.channel_is_up.load(Ordering::SeqCst));
        assert!(state.pushed_blocks.lock().unwrap().is_empty());
        assert_eq!(dexter.num_frames_modulated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sync_frame_in_startup_returns_silently() {
        let config = SdrDeviceConfig::default().with_sync(true);
        let (state, dexter) = make_dexter(config);
        state.pushed_blocks.lock().unwrap().clear();

        let ts = FrameTimestamp {
            timestamp_valid: true,
            ..Default::default()
        };
        dexter.transmit_frame(full_frame(ts)).unwrap();

        assert!(!dexter.channel_is_up.load(Ordering::SeqCst));
        assert!(state.pushed_blocks.lock().unwrap().is_empty());
        assert_eq!(dexter.num_late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refresh_request_rearms() {
        let (state, dexter) = make_dexter(SdrDeviceConfig::default());
        state.pushed_blocks.lock().unwrap().clear();

        dexter
            .transmit_frame(full_frame(FrameTimestamp::default()))
            .unwrap();
        assert!(dexter.channel_is_up.load(Ordering::SeqCst));

        dexter.require_timestamp_refresh();
        dexter
            .transmit_frame(full_frame(FrameTimestamp::default()))
            .unwrap();

        // channel went down mid-hand-off, nothing was pushed for frame 2
        assert!(!dexter.channel_is_up.load(Ordering::SeqCst));
        assert_eq!(state.pushed_blocks.lock().unwrap().len(), 2);
        // start_clks was cleared on the way down
        assert_eq!(state.writes_to("stream0_start_clks").last(), Some(&0));
    }

    #[test]
    fn test_push_failure_brings_channel_down() {
        let (state, dexter) = make_dexter(SdrDeviceConfig::default());
        state.pushed_blocks.lock().unwrap().clear();
        *state.push_result.lock().unwrap() = Some(-5);

        dexter
            .transmit_frame(full_frame(FrameTimestamp::default()))
            .unwrap();

        assert!(!dexter.channel_is_up.load(Ordering::SeqCst));
        assert!(state.pushed_blocks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clock_state_machine_holdover_walk() {
        let mut config = SdrDeviceConfig::default().with_sync(true);
        config.max_gps_holdover_time = 0;
        let (state, dexter) = make_dexter(config);
        *state.pps_clks_step.lock().unwrap() = DSP_CLOCK as i64;

        // GPSDO not locked: stays in Startup, not ok
        assert!(!dexter.is_clk_source_ok().unwrap());
        assert_eq!(dexter.clock.lock().unwrap().state, ClockState::Startup);

        // Lock appears: alignment runs and lands in Normal
        state.set_attr(DSP_TX, "gpsdo_locked", 1);
        assert!(dexter.is_clk_source_ok().unwrap());
        assert_eq!(dexter.clock.lock().unwrap().state, ClockState::Normal);
        assert!(dexter.clock.lock().unwrap().clock_count_at_startup > 0);

        // PPS loss: Normal -> Holdover, still usable
        state.set_attr(DSP_TX, "pps_loss_of_signal", 1);
        assert!(dexter.is_clk_source_ok().unwrap());
        assert_eq!(dexter.clock.lock().unwrap().state, ClockState::Holdover);

        // Tolerance of zero seconds: next tick falls back to Startup with
        // all arming state cleared
        std::thread::sleep(Duration::from_millis(10));
        assert!(!dexter.is_clk_source_ok().unwrap());
        {
            let clock = dexter.clock.lock().unwrap();
            assert_eq!(clock.state, ClockState::Startup);
            assert_eq!(clock.utc_seconds_at_startup, 0);
            assert_eq!(clock.clock_count_at_startup, 0);
        }

        // PPS returns: full realignment back to Normal
        state.set_attr(DSP_TX, "pps_loss_of_signal", 0);
        assert!(dexter.is_clk_source_ok().unwrap());
        assert_eq!(dexter.clock.lock().unwrap().state, ClockState::Normal);
    }

    #[test]
    fn test_inconsistent_pps_clks_fails_alignment() {
        let config = SdrDeviceConfig::default().with_sync(true);
        let (state, dexter) = make_dexter(config);
        state.set_attr(DSP_TX, "gpsdo_locked", 1);
        // pps_clks does not advance at all between the two samples
        *state.pps_clks_step.lock().unwrap() = 0;

        assert!(matches!(
            dexter.is_clk_source_ok(),
            Err(SdrError::ClockAlignment { .. })
        ));
    }

    #[test]
    fn test_clk_source_ok_without_sync() {
        let (_state, dexter) = make_dexter(SdrDeviceConfig::default());
        assert!(dexter.is_clk_source_ok().unwrap());
        // no state machine tick happened
        assert_eq!(dexter.clock.lock().unwrap().state, ClockState::Startup);
    }

    #[test]
    fn test_get_real_secs() {
        let (state, dexter) = make_dexter(SdrDeviceConfig::default());

        // Startup reports zero
        assert_eq!(dexter.get_real_secs().unwrap(), 0.0);

        // half a second past the alignment edge
        dexter.clock.lock().unwrap().align(1_700_000_000, 0);
        state.set_attr(DSP_TX, "clks", DSP_CLOCK as i64 / 2);
        let secs = dexter.get_real_secs().unwrap();
        assert!((secs - 1_700_000_000.5).abs() < 1e-6);
    }

    #[test]
    fn test_txgain_readback_updates_config() {
        let (_state, dexter) = make_dexter(SdrDeviceConfig::default());
        dexter.set_txgain(71.0);
        assert_eq!(dexter.get_txgain(), 71.0);
        assert_eq!(dexter.config.lock().unwrap().txgain, 71.0);

        // idempotent: setting the same value leaves the readback in place
        dexter.set_txgain(71.0);
        assert_eq!(dexter.config.lock().unwrap().txgain, 71.0);
    }

    #[test]
    fn test_tune_and_readback() {
        let (_state, dexter) = make_dexter(SdrDeviceConfig::default());
        dexter.tune(10_000, 222_064_000);
        assert_eq!(dexter.get_tx_freq(), 222_074_000);
    }

    #[test]
    fn test_underflow_poller_publishes() {
        let (state, dexter) = make_dexter(SdrDeviceConfig::default());
        state.set_attr(DSP_TX, "buffer_underflows0", 3);

        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(*dexter.underflows.lock().unwrap(), 3);

        let rs = dexter.get_run_statistics();
        assert_eq!(rs.get("underruns"), Some(&StatValue::Uint(3)));
    }

    #[test]
    fn test_statistics_contract() {
        let (state, dexter) = make_dexter(SdrDeviceConfig::default());
        state.set_attr(DSP_TX, "stream0_fifo_not_empty_clks", 17);
        state.set_attr(DSP_TX, "pps_clk_error_hz", -2);
        state.set_attr(DSP_TX, "pps_cnt", 99);
        state.set_attr(DSP_TX, "dsp_version", 7);

        let rs = dexter.get_run_statistics();
        for key in [
            "underruns",
            "latepackets",
            "frames",
            "clks",
            "fifo_not_empty_clks",
            "gpsdo_locked",
            "pps_clk_error_hz",
            "pps_cnt",
            "pps_loss_of_signal",
            "dsp_version",
            "in_holdover_since",
            "clock_state",
            "remaining_holdover_s",
            "vcc_main_in",
            "vcc5v4",
            "vcc3v3",
            "vfan",
            "vcc3v3pll",
            "vcc2v5io",
            "vccocxo",
            "tempfpga",
            "voltage_alarm",
            "temp_alarm",
        ] {
            assert!(rs.contains_key(key), "missing statistic {}", key);
        }

        assert_eq!(
            rs.get("clock_state"),
            Some(&StatValue::Text("startup".into()))
        );
        assert_eq!(rs.get("fifo_not_empty_clks"), Some(&StatValue::Int(17)));
        // no sensors behind the temp-dir roots: alarms must be raised
        assert_eq!(rs.get("voltage_alarm"), Some(&StatValue::Bool(true)));
        assert_eq!(rs.get("temp_alarm"), Some(&StatValue::Bool(true)));
    }
}
