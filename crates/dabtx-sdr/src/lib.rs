//! # DAB SDR Output Core
//!
//! This crate is the output end of a DAB modulator: it takes pre-modulated
//! baseband IQ frames together with their broadcast timestamps and hands
//! them to a radio front end so that each frame is radiated at its
//! prescribed instant on the DAB transmission grid.
//!
//! The modulator chain upstream is deterministic computation; the work
//! here is reconciling the host clock with the transmitter's
//! GPSDO-disciplined FPGA clock, surviving PPS loss in a bounded holdover
//! window, pre-scheduling frames with enough hand-off margin, and staying
//! remote-controllable while a realtime worker feeds the hardware.
//!
//! # Architecture
//!
//! ```text
//! modulator ──process()──▶ SdrOutput ──queue──▶ worker ──▶ SdrDevice
//!                              │                              │
//!                       remote control                 DEXTER / simulated
//! ```
//!
//! - [`SdrOutput`] receives IQ buffers and metadata, pairs them into
//!   [`FrameData`] and owns the transmitter worker thread
//! - [`SdrDevice`] is the capability every backend implements
//! - [`dexter::Dexter`] drives the PrecisionWave DEXTER board over IIO
//! - [`sim::SimulatedSdr`] stands in for hardware in development and tests
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//! use dabtx_sdr::{SdrDeviceConfig, SdrOutput, sim::SimulatedSdr};
//!
//! let config = Arc::new(Mutex::new(SdrDeviceConfig::default().with_sync(true)));
//! let device = Arc::new(SimulatedSdr::new(Arc::clone(&config)));
//! let mut output = SdrOutput::new(config, device).unwrap();
//!
//! // per transmission frame, from the modulator:
//! // output.process(&iq_bytes)?; output.process_metadata(&metadata);
//! ```

pub mod channels;
pub mod config;
pub mod dexter;
pub mod dpd;
pub mod error;
pub mod queue;
pub mod remote;
pub mod rt;
pub mod sdr;
pub mod sim;
pub mod traits;
pub mod types;

pub use config::SdrDeviceConfig;
pub use error::{ParameterError, Result, SdrError};
pub use queue::{FrameQueue, Popped, PushResult};
pub use remote::{Parameter, RemoteControllable};
pub use sdr::SdrOutput;
pub use traits::SdrDevice;
pub use types::{
    DabMode, FrameData, FrameMetadata, FrameTimestamp, RunStatistics, StatValue,
    TIMESTAMP_PPS_RATE,
};
