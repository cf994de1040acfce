//! Caller audio capture
//!
//! [`AudioCapture`] records at most one bounded turn at a time from a
//! [`Microphone`]. The device is opened when a recording starts and released
//! as soon as it ends, whether it was stopped, timed out or aborted.

use crate::error::{CallError, Result};
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

pub const SAMPLE_RATE: u32 = 16000;
pub const CHANNELS: u16 = 1;

/// An audio input device.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the device. Dropping the returned stream releases it.
    async fn open(&self) -> Result<Box<dyn MicStream>>;
}

/// Mono 16 kHz PCM from an open device.
#[async_trait]
pub trait MicStream: Send {
    /// Next block of samples, or `None` once the source is exhausted.
    async fn read(&mut self) -> Option<Vec<i16>>;
}

#[derive(Debug)]
pub enum CaptureOutcome {
    /// WAV-encoded recording; `None` when nothing was captured
    Captured(Option<Vec<u8>>),
    Failed(CallError),
}

struct ActiveCapture {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct AudioCapture {
    microphone: Arc<dyn Microphone>,
    active: Option<ActiveCapture>,
}

impl AudioCapture {
    pub fn new(microphone: Arc<dyn Microphone>) -> Self {
        Self {
            microphone,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.task.is_finished())
    }

    /// Record for at most `max`. `done` receives the result once recording
    /// stops by itself or through [`stop`](Self::stop); it is never called
    /// after [`abort`](Self::abort). Returns false if a recording is already
    /// running.
    pub fn start<F>(&mut self, max: Duration, done: F) -> bool
    where
        F: FnOnce(CaptureOutcome) + Send + 'static,
    {
        if self.is_active() {
            warn!("🎤 Capture already running, ignoring start");
            return false;
        }

        let microphone = self.microphone.clone();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let outcome = match record(microphone, max, stop_rx).await {
                Ok(chunk) => CaptureOutcome::Captured(chunk),
                Err(e) => CaptureOutcome::Failed(e),
            };
            done(outcome);
        });

        self.active = Some(ActiveCapture {
            stop_tx: Some(stop_tx),
            task,
        });
        true
    }

    /// Finish the current recording early and deliver what was captured.
    pub fn stop(&mut self) {
        if let Some(tx) = self.active.as_mut().and_then(|a| a.stop_tx.take()) {
            debug!("Stopping capture");
            let _ = tx.send(());
        }
    }

    /// Drop the current recording and release the device.
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            if !active.task.is_finished() {
                debug!("Aborting capture");
            }
            active.task.abort();
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn record(
    microphone: Arc<dyn Microphone>,
    max: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<Option<Vec<u8>>> {
    let mut stream = microphone.open().await?;
    let deadline = Instant::now() + max;
    let mut samples: Vec<i16> = Vec::new();
    let mut exhausted = false;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = sleep_until(deadline) => {
                debug!("Recording limit of {:?} reached", max);
                break;
            }
            block = stream.read(), if !exhausted => match block {
                Some(block) => samples.extend_from_slice(&block),
                None => exhausted = true,
            },
        }
    }
    drop(stream);

    info!(
        "🎤 Captured {:.2}s of audio",
        samples.len() as f32 / SAMPLE_RATE as f32
    );
    encode_wav(&samples)
}

/// Encode mono 16-bit PCM as an in-memory WAV file.
pub fn encode_wav(samples: &[i16]) -> Result<Option<Vec<u8>>> {
    if samples.is_empty() {
        return Ok(None);
    }

    let spec = hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(Some(cursor.into_inner()))
}
