//! SDR output stage
//!
//! Front end of the output pipeline. The modulator hands IQ bytes to
//! [`SdrOutput::process`] and the matching timestamps to
//! [`SdrOutput::process_metadata`]; complete frames are queued towards the
//! transmitter worker, which verifies their timestamps against the device
//! clock and hands them to the [`SdrDevice`]. Gain, frequency, muting and
//! synchronisation are live-controllable through [`RemoteControllable`].

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::channels::{convert_frequency_to_channel, parse_channel};
use crate::config::SdrDeviceConfig;
use crate::dpd::DpdFeedbackServer;
use crate::error::{ParameterError, Result, SdrError};
use crate::queue::{FrameQueue, Popped};
use crate::remote::{Parameter, RemoteControllable};
use crate::rt;
use crate::traits::SdrDevice;
use crate::types::{FrameData, FrameMetadata, RunStatistics, StatValue, TIMESTAMP_PPS_RATE};

/// Queue bound without synchronisation: keep the delay short
const FRAMES_MAX_SIZE_UNSYNC: usize = 8;

/// Queue bound with synchronisation: several seconds of margin
const FRAMES_MAX_SIZE_SYNC: usize = 250;

/// Abort when a timestamp lies further in the future than this
const TIMESTAMP_ABORT_FUTURE_S: f64 = 100.0;

const WORKER_PRIORITY: i32 = 1;

/// The SDR output stage (see module docs)
pub struct SdrOutput {
    config: Arc<Mutex<SdrDeviceConfig>>,
    device: Arc<dyn SdrDevice>,
    queue: Arc<FrameQueue<FrameData>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,

    /// Staging buffer: IQ bytes arrive before their metadata
    staged: Vec<u8>,
    sample_size: usize,

    dpd_feedback: Option<DpdFeedbackServer>,
    num_queue_overflows: AtomicU64,
}

impl SdrOutput {
    /// Start the output stage on the given device. The worker thread is
    /// spawned immediately; frames flow once `process`/`process_metadata`
    /// are called.
    pub fn new(config: Arc<Mutex<SdrDeviceConfig>>, device: Arc<dyn SdrDevice>) -> Result<Self> {
        // muting is remote-controlled, start every run unmuted
        let (port, sample_rate) = {
            let mut config = config.lock().unwrap();
            config.muting = false;
            (config.dpd_feedback_server_port, config.sample_rate)
        };

        let dpd_feedback = if port > 0 {
            Some(DpdFeedbackServer::new(
                Arc::downgrade(&device),
                port,
                sample_rate,
            )?)
        } else {
            None
        };

        let queue = Arc::new(FrameQueue::new());
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let device = Arc::clone(&device);
            let config = Arc::clone(&config);
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            rt::spawn_rt_thread("sdr-worker", WORKER_PRIORITY, move || {
                process_thread_entry(device, config, queue, running)
            })?
        };

        Ok(Self {
            config,
            device,
            queue,
            running,
            worker: Some(worker),
            staged: Vec::new(),
            sample_size: 4,
            dpd_feedback,
            num_queue_overflows: AtomicU64::new(0),
        })
    }

    /// Name of this output, including the device backend
    pub fn name(&self) -> String {
        format!("OutputSDR({})", self.device.device_name())
    }

    /// Bytes per complex sample of the incoming IQ data
    pub fn set_sample_size(&mut self, size: usize) {
        self.sample_size = size;
    }

    /// Stage the IQ bytes of one transmission frame. The frame is not
    /// complete until its metadata arrives.
    pub fn process(&mut self, data: &[u8]) -> Result<usize> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SdrError::WorkerDead);
        }

        self.staged.clear();
        self.staged.extend_from_slice(data);
        Ok(data.len())
    }

    /// Complete the staged frame with its timestamps and enqueue it.
    ///
    /// In transmission modes where several ETI frames build one
    /// transmission frame, `metadata` has one entry per contributing ETI
    /// frame; the EARLIEST one carries the frame's start time.
    pub fn process_metadata(&mut self, metadata: &[FrameMetadata]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let buf = mem::take(&mut self.staged);

        if metadata.is_empty() {
            tracing::info!("SDR output: dropping one frame with invalid FCT");
            return;
        }

        let frame = FrameData {
            buf,
            sample_size: self.sample_size,
            ts: metadata[0].ts,
        };

        if let Some(feedback) = &self.dpd_feedback {
            if let Err(e) = feedback.set_tx_frame(&frame.buf, frame.ts) {
                tracing::warn!("SDR output: feedback server failed ({}), restarting", e);
                self.restart_dpd_feedback();
            }
        }

        let max_size = if self.config.lock().unwrap().enable_sync {
            FRAMES_MAX_SIZE_SYNC
        } else {
            FRAMES_MAX_SIZE_UNSYNC
        };

        let result = self.queue.push_overflow(frame, max_size);
        tracing::trace!(
            "SDR push overflowed={} size={}",
            result.overflowed,
            result.new_size
        );
        if result.overflowed {
            self.num_queue_overflows.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn restart_dpd_feedback(&mut self) {
        self.dpd_feedback = None;

        let (port, sample_rate) = {
            let config = self.config.lock().unwrap();
            (config.dpd_feedback_server_port, config.sample_rate)
        };

        match DpdFeedbackServer::new(Arc::downgrade(&self.device), port, sample_rate) {
            Ok(server) => self.dpd_feedback = Some(server),
            Err(e) => tracing::error!("SDR output: could not restart feedback server: {}", e),
        }
    }
}

impl Drop for SdrOutput {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.trigger_wakeup();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Transmitter worker: blocking pop, timestamp verification, hand-off
fn process_thread_entry(
    device: Arc<dyn SdrDevice>,
    config: Arc<Mutex<SdrDeviceConfig>>,
    queue: Arc<FrameQueue<FrameData>>,
    running: Arc<AtomicBool>,
) {
    let mut worker = Worker {
        device,
        config,
        last_tx: None,
    };

    while running.load(Ordering::SeqCst) {
        let frame = match queue.wait_and_pop() {
            Popped::Element(frame) => frame,
            Popped::Wakeup => break,
        };

        if !running.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = worker.handle_frame(frame) {
            tracing::error!("SDR output thread caught error: {}", e);
            break;
        }
    }

    running.store(false, Ordering::SeqCst);
}

struct Worker {
    device: Arc<dyn SdrDevice>,
    config: Arc<Mutex<SdrDeviceConfig>>,
    /// `(tx_second, tx_pps)` of the last accepted frame
    last_tx: Option<(u32, u32)>,
}

impl Worker {
    fn handle_frame(&mut self, frame: FrameData) -> Result<()> {
        if !self.device.is_clk_source_ok()? {
            return Ok(());
        }

        let (enable_sync, mute_no_timestamps, muting, sample_rate) = {
            let config = self.config.lock().unwrap();
            (
                config.enable_sync,
                config.mute_no_timestamps,
                config.muting,
                config.sample_rate,
            )
        };

        let ts = frame.ts;

        if enable_sync && mute_no_timestamps && !ts.timestamp_valid {
            tracing::info!("OutputSDR: muting FCT={}: no timestamp", ts.fct);
            return Ok(());
        }

        if enable_sync && ts.timestamp_valid {
            // Tx time from MNSC and TIST
            let tx_second = ts.timestamp_sec;
            let tx_pps = ts.timestamp_pps;

            let device_time = self.device.get_real_secs()?;

            if ts.offset_changed {
                tracing::debug!("TS offset changed");
                self.device.require_timestamp_refresh();
            }

            if let Some((last_second, last_pps)) = self.last_tx {
                let size_in = frame.buf.len() / frame.sample_size;

                // samps * ticks/s / (samps/s) = ticks
                let increment = size_in as u64 * TIMESTAMP_PPS_RATE / sample_rate;

                let mut expected_second = last_second + (increment / TIMESTAMP_PPS_RATE) as u32;
                let mut expected_pps = last_pps + (increment % TIMESTAMP_PPS_RATE) as u32;
                while expected_pps as u64 >= TIMESTAMP_PPS_RATE {
                    expected_second += 1;
                    expected_pps -= TIMESTAMP_PPS_RATE as u32;
                }

                if expected_second != tx_second || expected_pps != tx_pps {
                    tracing::warn!(
                        "OutputSDR: timestamp irregularity at FCT={}, expected {}+{} got {}+{}",
                        ts.fct,
                        expected_second,
                        expected_pps,
                        tx_second,
                        tx_pps
                    );
                    self.device.require_timestamp_refresh();
                }
            }

            self.last_tx = Some((tx_second, tx_pps));

            if ts.get_real_secs() < device_time {
                tracing::warn!(
                    "OutputSDR: timestamp in the past at FCT={}, offset {:.6} ({:.6})",
                    ts.fct,
                    ts.get_real_secs() - device_time,
                    device_time
                );
                self.device.require_timestamp_refresh();
                return Ok(());
            }

            if ts.get_real_secs() > device_time + TIMESTAMP_ABORT_FUTURE_S {
                tracing::error!(
                    "OutputSDR: timestamp too far in the future at FCT={}, offset {:.6}",
                    ts.fct,
                    ts.get_real_secs() - device_time
                );
                return Err(SdrError::TimestampAbort {
                    offset: ts.get_real_secs() - device_time,
                });
            }
        }

        if muting {
            tracing::info!("OutputSDR: muting FCT={} requested", ts.fct);
            self.device.require_timestamp_refresh();
            return Ok(());
        }

        self.device.transmit_frame(frame)
    }
}

// =======================================
// Remote Control
// =======================================

impl RemoteControllable for SdrOutput {
    fn rc_name(&self) -> &str {
        "sdr"
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![
            Parameter::new("txgain", "TX gain"),
            Parameter::new("rxgain", "RX gain for DPD feedback"),
            Parameter::new("bandwidth", "Analog front-end bandwidth"),
            Parameter::new("freq", "Transmission frequency in Hz"),
            Parameter::new("channel", "Transmission frequency as channel"),
            Parameter::new("muting", "Mute the output by stopping the transmitter"),
            Parameter::new("temp", "Temperature in degrees C of the device"),
            Parameter::new("underruns", "Counter of number of underruns"),
            Parameter::new("latepackets", "Counter of number of late packets"),
            Parameter::new("frames", "Counter of number of frames modulated"),
            Parameter::new("synchronous", "1 if configured for synchronous transmission"),
            Parameter::new("max_gps_holdover_time", "Max holdover duration in seconds"),
            Parameter::new(
                "queued_frames_ms",
                "Number of frames queued, represented in milliseconds",
            ),
        ];

        if self.device.device_name() == "Dexter" {
            params.push(Parameter::new(
                "in_holdover_since",
                "UTC timestamp when holdover began",
            ));
            params.push(Parameter::new(
                "remaining_holdover_s",
                "Remaining number of seconds in holdover",
            ));
            params.push(Parameter::new(
                "clock_state",
                "Clock state: startup/normal/holdover",
            ));
        }

        params
    }

    fn set_parameter(&self, parameter: &str, value: &str) -> std::result::Result<(), ParameterError> {
        match parameter {
            "txgain" => {
                let gain: f64 = parse_value(parameter, value)?;
                self.config.lock().unwrap().txgain = gain;
                self.device.set_txgain(gain);
            }
            "rxgain" => {
                let gain: f64 = parse_value(parameter, value)?;
                self.config.lock().unwrap().rxgain = gain;
                self.device.set_rxgain(gain);
            }
            "bandwidth" => {
                let bandwidth: u64 = parse_value(parameter, value)?;
                self.config.lock().unwrap().bandwidth = bandwidth;
                self.device.set_bandwidth(bandwidth);
            }
            "freq" => {
                let frequency: u64 = parse_value(parameter, value)?;
                let lo_offset = {
                    let mut config = self.config.lock().unwrap();
                    config.frequency = frequency;
                    config.lo_offset
                };
                self.device.tune(lo_offset, frequency);
            }
            "channel" => {
                let frequency = parse_channel(value)
                    .ok_or_else(|| ParameterError("Cannot parse channel".to_string()))?;
                let lo_offset = {
                    let mut config = self.config.lock().unwrap();
                    config.frequency = frequency;
                    config.lo_offset
                };
                self.device.tune(lo_offset, frequency);
            }
            "muting" => {
                let muting: u8 = parse_value(parameter, value)?;
                self.config.lock().unwrap().muting = muting > 0;
            }
            "synchronous" => {
                let enable: u32 = parse_value(parameter, value)?;
                self.config.lock().unwrap().enable_sync = enable > 0;
            }
            "max_gps_holdover_time" => {
                let seconds: u64 = parse_value(parameter, value)?;
                self.config.lock().unwrap().max_gps_holdover_time = seconds;
            }
            _ => return Err(ParameterError::not_exported(parameter, self.rc_name())),
        }
        Ok(())
    }

    fn get_parameter(&self, parameter: &str) -> std::result::Result<String, ParameterError> {
        let value = match parameter {
            "txgain" => StatValue::Float(self.config.lock().unwrap().txgain),
            "rxgain" => StatValue::Float(self.config.lock().unwrap().rxgain),
            "bandwidth" => StatValue::Uint(self.config.lock().unwrap().bandwidth),
            "freq" => StatValue::Uint(self.config.lock().unwrap().frequency),
            "channel" => {
                let frequency = self.config.lock().unwrap().frequency;
                let channel = convert_frequency_to_channel(frequency).ok_or_else(|| {
                    ParameterError("Frequency is outside list of channels".to_string())
                })?;
                StatValue::Text(channel.to_string())
            }
            "muting" => StatValue::Bool(self.config.lock().unwrap().muting),
            "synchronous" => StatValue::Bool(self.config.lock().unwrap().enable_sync),
            "max_gps_holdover_time" => {
                StatValue::Uint(self.config.lock().unwrap().max_gps_holdover_time)
            }
            "temp" => {
                let temp = self
                    .device
                    .get_temperature()
                    .ok_or_else(|| ParameterError("Temperature not available".to_string()))?;
                StatValue::Float(temp)
            }
            "queued_frames_ms" => {
                let frame_ms = {
                    let config = self.config.lock().unwrap();
                    config.dab_mode.transmission_frame_duration().as_millis() as u64
                };
                StatValue::Uint(self.queue.len() as u64 * frame_ms)
            }
            _ => {
                // Anything else may still be a device statistic
                let stats = self.device.get_run_statistics();
                stats
                    .get(parameter)
                    .cloned()
                    .ok_or_else(|| ParameterError::not_exported(parameter, self.rc_name()))?
            }
        };
        Ok(value.to_string())
    }

    fn get_all_values(&self) -> RunStatistics {
        let mut stats = self.device.get_run_statistics();

        let (txgain, rxgain, frequency, muting, enable_sync, max_holdover, frame_ms) = {
            let config = self.config.lock().unwrap();
            (
                config.txgain,
                config.rxgain,
                config.frequency,
                config.muting,
                config.enable_sync,
                config.max_gps_holdover_time,
                config.dab_mode.transmission_frame_duration().as_millis() as u64,
            )
        };

        stats.insert("txgain".into(), StatValue::Float(txgain));
        stats.insert("rxgain".into(), StatValue::Float(rxgain));
        stats.insert("freq".into(), StatValue::Uint(frequency));
        stats.insert("muting".into(), StatValue::Bool(muting));
        stats.insert("synchronous".into(), StatValue::Bool(enable_sync));
        stats.insert("max_gps_holdover_time".into(), StatValue::Uint(max_holdover));

        stats.insert(
            "channel".into(),
            match convert_frequency_to_channel(frequency) {
                Some(channel) => StatValue::Text(channel.to_string()),
                None => StatValue::Null,
            },
        );
        stats.insert(
            "temp".into(),
            match self.device.get_temperature() {
                Some(temp) => StatValue::Float(temp),
                None => StatValue::Null,
            },
        );
        stats.insert(
            "queued_frames_ms".into(),
            StatValue::Uint(self.queue.len() as u64 * frame_ms),
        );
        stats.insert(
            "queue_overflows".into(),
            StatValue::Uint(self.num_queue_overflows.load(Ordering::SeqCst)),
        );

        stats
    }
}

fn parse_value<T: std::str::FromStr>(
    parameter: &str,
    value: &str,
) -> std::result::Result<T, ParameterError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ParameterError::bad_value(parameter, value))
}
