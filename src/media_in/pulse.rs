//! PulseAudio microphone
//!
//! The blocking PulseAudio read loop runs on its own thread for as long as
//! the stream is held. Dropping the stream stops the thread, which releases
//! the device.

use crate::capture::{MicStream, Microphone, CHANNELS, SAMPLE_RATE};
use crate::error::{CallError, Result};
use async_trait::async_trait;
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

const CHUNK_DURATION_MS: u64 = 20;
const SAMPLES_PER_CHUNK: usize = (SAMPLE_RATE as u64 * CHUNK_DURATION_MS / 1000) as usize;

#[derive(Debug, Clone, Default)]
pub struct PulseMicrophone {
    /// Source name; `None` uses the server default
    device: Option<String>,
}

impl PulseMicrophone {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl Microphone for PulseMicrophone {
    async fn open(&self) -> Result<Box<dyn MicStream>> {
        let (block_tx, block_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));

        let device = self.device.clone();
        let thread_running = running.clone();
        std::thread::spawn(move || capture_thread(device, block_tx, ready_tx, thread_running));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(PulseStream { rx: block_rx, running })),
            Ok(Err(reason)) => Err(CallError::Device(reason)),
            Err(_) => Err(CallError::Device("capture thread exited".to_string())),
        }
    }
}

struct PulseStream {
    rx: mpsc::Receiver<Vec<i16>>,
    running: Arc<AtomicBool>,
}

#[async_trait]
impl MicStream for PulseStream {
    async fn read(&mut self) -> Option<Vec<i16>> {
        self.rx.recv().await
    }
}

impl Drop for PulseStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn capture_thread(
    device: Option<String>,
    tx: mpsc::Sender<Vec<i16>>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
    running: Arc<AtomicBool>,
) {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::S16le,
        channels: CHANNELS as u8,
        rate: SAMPLE_RATE,
    };

    let capture = match psimple::Simple::new(
        None,
        "callbot",
        pulse::stream::Direction::Record,
        device.as_deref(),
        "caller",
        &spec,
        None,
        None,
    ) {
        Ok(capture) => capture,
        Err(e) => {
            error!("Failed to open PulseAudio source: {}", e);
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    info!("🎤 Microphone acquired");
    let _ = ready.send(Ok(()));

    let mut bytes = vec![0u8; SAMPLES_PER_CHUNK * 2];
    while running.load(Ordering::SeqCst) {
        if let Err(e) = capture.read(&mut bytes) {
            error!("Microphone read failed: {}", e);
            break;
        }
        let block: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if tx.blocking_send(block).is_err() {
            break;
        }
    }

    debug!("🎤 Microphone released");
}
