//! Client configuration
//!
//! Everything has a working default pointing at a backend on localhost; the
//! binaries layer `CALLBOT_*` environment variables on top.

use std::path::PathBuf;
use std::time::Duration;

/// Longest a single user turn may be recorded before it stops itself.
pub const MAX_RECORDING_MS: u64 = 8000;

/// Pause between the end of an AI turn and the next recording, so the
/// microphone does not pick up the tail of the bot's own audio.
pub const POST_TURN_DELAY_MS: u64 = 500;

/// Spoken when the backend escalates without supplying its own audio.
pub const DEFAULT_ESCALATION_NOTICE: &str =
    "Votre demande nécessite l'intervention d'un agent humain. Vous allez être transféré maintenant.";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the call API (`/call/start`, `/call/end`)
    pub backend_url: String,
    /// Realtime voice channel
    pub voice_ws_url: String,
    /// Base URL of the dashboard read model (`/api/calls`)
    pub dashboard_url: String,
    pub max_recording: Duration,
    pub post_turn_delay: Duration,
    /// How long to wait for a streamed escalation announcement before
    /// escalating without it
    pub announcement_wait: Duration,
    /// Text announced on escalation when the server sends no audio.
    /// `None` skips the announcement entirely.
    pub escalation_notice: Option<String>,
    pub notice_lang: String,
    /// WAV file used as microphone input when no device backend is built in
    pub mic_wav: Option<PathBuf>,
    /// PulseAudio source name; `None` uses the server default
    pub mic_device: Option<String>,
    /// Where received AI audio segments are written
    pub recordings_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000".to_string(),
            voice_ws_url: "ws://localhost:8000/ws/voice".to_string(),
            dashboard_url: "http://127.0.0.1:5000".to_string(),
            max_recording: Duration::from_millis(MAX_RECORDING_MS),
            post_turn_delay: Duration::from_millis(POST_TURN_DELAY_MS),
            announcement_wait: Duration::from_secs(15),
            escalation_notice: Some(DEFAULT_ESCALATION_NOTICE.to_string()),
            notice_lang: "fr-FR".to_string(),
            mic_wav: None,
            mic_device: None,
            recordings_dir: PathBuf::from("recordings"),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by any `CALLBOT_*` variables present.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("CALLBOT_BACKEND_URL") {
            config.backend_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("CALLBOT_VOICE_WS_URL") {
            config.voice_ws_url = url;
        }
        if let Some(url) = lookup("CALLBOT_DASHBOARD_URL") {
            config.dashboard_url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = lookup("CALLBOT_MIC_WAV") {
            config.mic_wav = Some(PathBuf::from(path));
        }
        if let Some(device) = lookup("CALLBOT_MIC_DEVICE") {
            config.mic_device = Some(device);
        }
        if let Some(dir) = lookup("CALLBOT_RECORDINGS_DIR") {
            config.recordings_dir = PathBuf::from(dir);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_backend_contract() {
        let config = ClientConfig::default();
        assert_eq!(config.voice_ws_url, "ws://localhost:8000/ws/voice");
        assert_eq!(config.max_recording, Duration::from_millis(8000));
        assert_eq!(config.post_turn_delay, Duration::from_millis(500));
        assert!(config.escalation_notice.is_some());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CALLBOT_BACKEND_URL", "http://calls.local:9000/"),
            ("CALLBOT_MIC_WAV", "/tmp/hello.wav"),
            ("CALLBOT_MIC_DEVICE", "alsa_input.usb-headset"),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.backend_url, "http://calls.local:9000");
        assert_eq!(config.mic_wav, Some(PathBuf::from("/tmp/hello.wav")));
        assert_eq!(config.mic_device.as_deref(), Some("alsa_input.usb-headset"));
        assert_eq!(config.dashboard_url, "http://127.0.0.1:5000");
    }
}
