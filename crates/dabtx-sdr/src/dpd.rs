//! DPD feedback server
//!
//! Serves the most recent transmitted frame (IQ bytes plus broadcast
//! timestamp) to an out-of-band pre-distortion computation engine over TCP.
//! The output stage hands every outgoing frame to
//! [`DpdFeedbackServer::set_tx_frame`]; a client request is answered with
//! the latest frame available at that moment.
//!
//! Wire protocol, all integers little-endian:
//!
//! ```text
//! request:  b"DPDq"
//! response: b"DPDr" u32 version=1  u32 sample_rate  f64 rxgain
//!           u32 timestamp_sec  u32 timestamp_pps  u64 num_bytes  payload
//! ```
//!
//! A dead server thread surfaces as an error from `set_tx_frame`; the
//! output stage rebuilds the server and carries on.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Result, SdrError};
use crate::traits::SdrDevice;
use crate::types::FrameTimestamp;

const PROTOCOL_VERSION: u32 = 1;

/// TCP server publishing transmitted frames for DPD estimation
pub struct DpdFeedbackServer {
    frame_tx: SyncSender<(Vec<u8>, FrameTimestamp)>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DpdFeedbackServer {
    /// Bind the server and start its thread. The device reference is
    /// non-owning; gain read-back stops once the device is gone.
    pub fn new(device: Weak<dyn SdrDevice>, port: u16, sample_rate: u64) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;

        // Depth 4: the engine only ever needs a recent frame, stale ones
        // are replaced on the serving side anyway.
        let (frame_tx, frame_rx) = sync_channel(4);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("dpd-feedback".to_string())
            .spawn(move || {
                serve(listener, frame_rx, thread_running, device, sample_rate);
            })?;

        tracing::info!("DPD feedback server listening on port {}", port);

        Ok(Self {
            frame_tx,
            running,
            handle: Some(handle),
        })
    }

    /// Hand one outgoing frame to the server. A full queue silently
    /// replaces nothing (the frame is skipped); a dead server thread is
    /// an error so the caller can restart the server.
    pub fn set_tx_frame(&self, buf: &[u8], ts: FrameTimestamp) -> Result<()> {
        match self.frame_tx.try_send((buf.to_vec(), ts)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(SdrError::FeedbackServerDead),
        }
    }
}

impl Drop for DpdFeedbackServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(
    listener: TcpListener,
    frame_rx: Receiver<(Vec<u8>, FrameTimestamp)>,
    running: Arc<AtomicBool>,
    device: Weak<dyn SdrDevice>,
    sample_rate: u64,
) {
    let mut latest: Option<(Vec<u8>, FrameTimestamp)> = None;

    while running.load(Ordering::SeqCst) {
        while let Ok(frame) = frame_rx.try_recv() {
            latest = Some(frame);
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("DPD client connected from {}", peer);
                if let Err(e) = answer_request(stream, &latest, &device, sample_rate) {
                    tracing::debug!("DPD client request failed: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                tracing::warn!("DPD feedback server accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn answer_request(
    mut stream: TcpStream,
    latest: &Option<(Vec<u8>, FrameTimestamp)>,
    device: &Weak<dyn SdrDevice>,
    sample_rate: u64,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;
    stream.set_nodelay(true)?;

    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic)?;
    if &magic != b"DPDq" {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad request magic",
        ));
    }

    let rxgain = device.upgrade().map(|d| d.get_rxgain()).unwrap_or(0.0);

    let (buf, ts) = match latest {
        Some((buf, ts)) => (buf.as_slice(), *ts),
        None => (&[][..], FrameTimestamp::default()),
    };

    stream.write_all(b"DPDr")?;
    stream.write_all(&PROTOCOL_VERSION.to_le_bytes())?;
    stream.write_all(&(sample_rate as u32).to_le_bytes())?;
    stream.write_all(&rxgain.to_le_bytes())?;
    stream.write_all(&ts.timestamp_sec.to_le_bytes())?;
    stream.write_all(&ts.timestamp_pps.to_le_bytes())?;
    stream.write_all(&(buf.len() as u64).to_le_bytes())?;
    stream.write_all(buf)?;
    stream.flush()
}
