//! WAV file as microphone input, paced like a live device.

use crate::capture::{MicStream, Microphone, SAMPLE_RATE};
use crate::error::{CallError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{info, warn};

const CHUNK_DURATION_MS: u64 = 20;
const SAMPLES_PER_CHUNK: usize = (SAMPLE_RATE as u64 * CHUNK_DURATION_MS / 1000) as usize;

/// Replays the same file on every recording.
#[derive(Debug, Clone)]
pub struct WavFileMicrophone {
    path: PathBuf,
}

impl WavFileMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Microphone for WavFileMicrophone {
    async fn open(&self) -> Result<Box<dyn MicStream>> {
        let path = self.path.clone();
        let samples = tokio::task::spawn_blocking(move || load_mono(&path))
            .await
            .map_err(|e| CallError::Device(e.to_string()))??;

        info!("🎤 Using {:?} as microphone ({} samples)", self.path, samples.len());
        let mut ticker = interval(Duration::from_millis(CHUNK_DURATION_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(WavStream {
            samples,
            pos: 0,
            ticker,
        }))
    }
}

struct WavStream {
    samples: Vec<i16>,
    pos: usize,
    ticker: Interval,
}

#[async_trait]
impl MicStream for WavStream {
    async fn read(&mut self) -> Option<Vec<i16>> {
        if self.pos >= self.samples.len() {
            return None;
        }
        self.ticker.tick().await;
        let end = (self.pos + SAMPLES_PER_CHUNK).min(self.samples.len());
        let block = self.samples[self.pos..end].to_vec();
        self.pos = end;
        Some(block)
    }
}

/// First channel of the file as 16-bit samples.
fn load_mono(path: &Path) -> Result<Vec<i16>> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| CallError::Device(format!("cannot open {:?}: {}", path, e)))?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE {
        warn!(
            "{:?} is {} Hz, expected {} Hz; sending as is",
            path, spec.sample_rate, SAMPLE_RATE
        );
    }

    let channels = spec.channels.max(1) as usize;
    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .into_samples::<i16>()
            .collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample.saturating_sub(16) as u32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<std::result::Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<std::result::Result<_, _>>()?,
    };

    Ok(interleaved.into_iter().step_by(channels).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for ch in 0..channels {
                writer.write_sample((i as i16) * 10 + ch as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replays_file_in_blocks() {
        let path = std::env::temp_dir().join(format!("callbot_mic_{}.wav", std::process::id()));
        write_wav(&path, 2, 500);

        let mic = WavFileMicrophone::new(&path);
        let mut stream = mic.open().await.unwrap();

        let first = stream.read().await.unwrap();
        assert_eq!(first.len(), SAMPLES_PER_CHUNK);
        assert_eq!(&first[..3], &[0, 10, 20]);

        let second = stream.read().await.unwrap();
        assert_eq!(second.len(), 500 - SAMPLES_PER_CHUNK);
        assert!(stream.read().await.is_none());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_device_error() {
        let mic = WavFileMicrophone::new("/nonexistent/callbot.wav");
        assert!(matches!(mic.open().await, Err(CallError::Device(_))));
    }
}
