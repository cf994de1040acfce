//! Callbot - terminal voice client
//!
//! Usage: `callbot "<name>" "+212 612345678"`
//!
//! Registers the caller, starts the call and runs it until the AI ends it,
//! it is escalated, or Ctrl-C hangs up.
//!
//! No speech synthesizer is wired in, so the default escalation notice is
//! only logged and the hand-off follows at once. Audio sent by the server
//! for the announcement is still played.

use anyhow::{bail, Context, Result};
use callbot::announce::SpeakerAnnouncer;
use callbot::backend::BackendClient;
use callbot::capture::Microphone;
use callbot::media_in::WavFileMicrophone;
use callbot::playback::RecordingSpeaker;
use callbot::presenter::TracingPresenter;
use callbot::transport::WsTransport;
use callbot::{CallController, CallParts, CallState, ClientConfig};
use chrono::Local;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn pick_microphone(config: &ClientConfig) -> Arc<dyn Microphone> {
    if let Some(path) = &config.mic_wav {
        return Arc::new(WavFileMicrophone::new(path.clone()));
    }
    #[cfg(feature = "pulse")]
    {
        Arc::new(callbot::media_in::PulseMicrophone::new(config.mic_device.clone()))
    }
    #[cfg(not(feature = "pulse"))]
    {
        warn!("⚠️ No microphone available; set CALLBOT_MIC_WAV or build with --features pulse");
        Arc::new(callbot::media_in::UnavailableMicrophone)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(name), Some(phone)) = (args.next(), args.next()) else {
        bail!("usage: callbot <name> <phone>");
    };

    let config = ClientConfig::from_env();
    info!("📞 Starting callbot against {}", config.backend_url);

    let backend = Arc::new(BackendClient::new(&config.backend_url, &config.dashboard_url));
    let speaker = Arc::new(RecordingSpeaker::new(&config.recordings_dir));
    let parts = CallParts {
        transport: Box::new(WsTransport::new()),
        registrar: backend.clone(),
        microphone: pick_microphone(&config),
        speaker: speaker.clone(),
        announcer: Arc::new(SpeakerAnnouncer::new(speaker)),
        presenter: Box::new(TracingPresenter),
    };
    let mut controller = CallController::new(&config, parts);

    let registration = controller
        .register(&name, &phone)
        .await
        .context("registration failed")?;
    controller.start_call().await.context("could not start the call")?;

    let handle = controller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, hanging up");
            handle.end_call(false);
        }
    });

    controller.run_until_finished().await;

    let session = controller.session();
    match session.state() {
        CallState::Escalated => {
            if let Some(report) = session.escalation_report(Local::now()) {
                println!("\n{}", report);
            }
        }
        CallState::Ended => {
            let call_id = session.session_id().unwrap_or(registration.session_id.as_str());
            match backend.end_call(call_id).await {
                Ok(Some(summary)) => println!("\n📝 {}", summary),
                Ok(None) => {}
                Err(e) => warn!("Could not fetch call summary: {}", e),
            }
        }
        CallState::Error => bail!("call ended with a connection error"),
        _ => {}
    }

    Ok(())
}
