//! Record one bounded turn from the configured microphone and save it.
//!
//! Usage: `mic_check [output.wav]`

use anyhow::{bail, Result};
use callbot::capture::{AudioCapture, CaptureOutcome, Microphone};
use callbot::media_in::WavFileMicrophone;
use callbot::ClientConfig;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let output = std::env::args().nth(1).unwrap_or_else(|| "mic_check.wav".to_string());
    let config = ClientConfig::from_env();

    let microphone: Arc<dyn Microphone> = match &config.mic_wav {
        Some(path) => Arc::new(WavFileMicrophone::new(path.clone())),
        #[cfg(feature = "pulse")]
        None => Arc::new(callbot::media_in::PulseMicrophone::default()),
        #[cfg(not(feature = "pulse"))]
        None => Arc::new(callbot::media_in::UnavailableMicrophone),
    };

    let mut capture = AudioCapture::new(microphone);
    let (tx, mut rx) = oneshot::channel();
    info!("🎤 Recording for up to {:?}, press Ctrl-C to stop early", config.max_recording);
    capture.start(config.max_recording, move |outcome| {
        let _ = tx.send(outcome);
    });

    let outcome = tokio::select! {
        outcome = &mut rx => outcome?,
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping early");
            capture.stop();
            rx.await?
        }
    };

    match outcome {
        CaptureOutcome::Captured(Some(chunk)) => {
            tokio::fs::write(&output, &chunk).await?;
            println!("✅ Saved {} KB to {}", chunk.len() / 1024, output);
        }
        CaptureOutcome::Captured(None) => println!("⚠️ Nothing was captured"),
        CaptureOutcome::Failed(e) => bail!("microphone error: {}", e),
    }
    Ok(())
}
