//! AI audio playback
//!
//! [`AudioPlayback`] runs one segment at a time on a [`Speaker`] and reports
//! how it ended. Playback is never cut off when audio gets suppressed; the
//! segment finishes and is reported as [`PlaybackOutcome::Interrupted`] so
//! the caller does not chain the next step.

use crate::error::Result;
use async_trait::async_trait;
use chrono::Local;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bitrate assumed for MP3 segments when estimating how long they play.
const ASSUMED_MP3_BITRATE_BPS: f64 = 32_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
}

/// Cooperative cancellation flag shared between the call session and the
/// audio components. Once set, nothing new may be captured or played.
#[derive(Debug, Clone, Default)]
pub struct SuppressFlag(Arc<AtomicBool>);

impl SuppressFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An audio output that plays an encoded segment to completion.
#[async_trait]
pub trait Speaker: Send + Sync {
    async fn play(&self, audio: Vec<u8>) -> Result<()>;
}

pub struct AudioPlayback {
    speaker: Arc<dyn Speaker>,
    suppress: SuppressFlag,
    /// Set while a segment is outstanding; cleared before its outcome is reported
    busy: Arc<AtomicBool>,
    active: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    pub fn new(speaker: Arc<dyn Speaker>, suppress: SuppressFlag) -> Self {
        Self {
            speaker,
            suppress,
            busy: Arc::new(AtomicBool::new(false)),
            active: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start playing `audio`. `done` is called exactly once with the outcome,
    /// unless [`stop`](Self::stop) is called first. While suppressed, `done`
    /// gets `Interrupted` straight away. Returns false (and does not call
    /// `done`) when another segment is still playing.
    pub fn play<F>(&mut self, audio: Vec<u8>, done: F) -> bool
    where
        F: FnOnce(PlaybackOutcome) + Send + 'static,
    {
        if self.suppress.is_set() {
            debug!("Audio suppressed, not playing {} bytes", audio.len());
            done(PlaybackOutcome::Interrupted);
            return true;
        }

        if self.is_playing() {
            warn!("🔇 Refusing overlapping playback ({} bytes)", audio.len());
            return false;
        }

        let speaker = self.speaker.clone();
        let suppress = self.suppress.clone();
        let busy = self.busy.clone();
        debug!("🔊 Playing {} bytes of AI audio", audio.len());

        busy.store(true, Ordering::SeqCst);
        self.active = Some(tokio::spawn(async move {
            if let Err(e) = speaker.play(audio).await {
                error!("Playback failed: {}", e);
            }
            let outcome = if suppress.is_set() {
                PlaybackOutcome::Interrupted
            } else {
                PlaybackOutcome::Completed
            };
            busy.store(false, Ordering::SeqCst);
            done(outcome);
        }));
        true
    }

    /// Abandon the current segment without reporting an outcome.
    pub fn stop(&mut self) {
        if let Some(task) = self.active.take() {
            if self.busy.swap(false, Ordering::SeqCst) {
                debug!("Stopping playback");
            }
            task.abort();
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speaker for headless runs: every segment is written under
/// `<recordings>/<timestamp>/` and "plays" for its estimated duration.
pub struct RecordingSpeaker {
    dir: PathBuf,
    counter: AtomicUsize,
}

impl RecordingSpeaker {
    pub fn new(base: &Path) -> Self {
        let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let dir = base.join(ts);
        info!("AI audio will be saved to: {:?}", dir);
        Self {
            dir,
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Speaker for RecordingSpeaker {
    async fn play(&self, audio: Vec<u8>) -> Result<()> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let ext = if is_wav(&audio) { "wav" } else { "mp3" };
        let path = self.dir.join(format!("segment_{:03}.{}", n, ext));

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, &audio).await?;

        let duration = estimate_duration(&audio);
        debug!("Saved AI segment to {:?} ({:?})", path, duration);
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

fn is_wav(audio: &[u8]) -> bool {
    audio.len() >= 12 && &audio[..4] == b"RIFF" && &audio[8..12] == b"WAVE"
}

/// Playing time of an encoded segment. WAV headers give the exact length;
/// anything else is treated as constant-bitrate MP3.
pub fn estimate_duration(audio: &[u8]) -> Duration {
    if is_wav(audio) {
        if let Ok(reader) = hound::WavReader::new(Cursor::new(audio)) {
            let spec = reader.spec();
            if spec.sample_rate > 0 {
                return Duration::from_secs_f64(reader.duration() as f64 / spec.sample_rate as f64);
            }
        }
    }
    Duration::from_secs_f64(audio.len() as f64 * 8.0 / ASSUMED_MP3_BITRATE_BPS)
}
