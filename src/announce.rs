//! Escalation announcements
//!
//! Before a call is handed to a human agent the caller hears a short notice.
//! It is either audio supplied by the server or a text notice that gets
//! synthesized locally. Both go through [`Announcer`], which ignores the
//! suppress flag: the announcement is the one thing allowed to play after
//! audio has been suppressed.

use crate::error::Result;
use crate::playback::Speaker;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum Announcement {
    /// Encoded audio from the server
    Audio(Vec<u8>),
    /// Text to speak in the given language
    Speech { text: String, lang: String },
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, lang: &str) -> Result<Vec<u8>>;
}

/// Completes once the announcement has been delivered.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, announcement: Announcement) -> Result<()>;
}

/// Plays audio announcements on a speaker. Text notices are synthesized
/// when a synthesizer is available and logged otherwise.
pub struct SpeakerAnnouncer {
    speaker: Arc<dyn Speaker>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

impl SpeakerAnnouncer {
    pub fn new(speaker: Arc<dyn Speaker>) -> Self {
        Self {
            speaker,
            synthesizer: None,
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }
}

#[async_trait]
impl Announcer for SpeakerAnnouncer {
    async fn announce(&self, announcement: Announcement) -> Result<()> {
        match announcement {
            Announcement::Audio(audio) => {
                info!("📢 Playing escalation announcement ({} bytes)", audio.len());
                self.speaker.play(audio).await
            }
            Announcement::Speech { text, lang } => match &self.synthesizer {
                Some(synth) => {
                    let audio = synth.synthesize(&text, &lang).await?;
                    self.speaker.play(audio).await
                }
                None => {
                    info!("📢 [{}] {}", lang, text);
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSpeaker(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl Speaker for CollectingSpeaker {
        async fn play(&self, audio: Vec<u8>) -> Result<()> {
            self.0.lock().unwrap().push(audio);
            Ok(())
        }
    }

    struct EchoSynth;

    #[async_trait]
    impl SpeechSynthesizer for EchoSynth {
        async fn synthesize(&self, text: &str, _lang: &str) -> Result<Vec<u8>> {
            Ok(text.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn test_announcement_strategies() {
        let speaker = Arc::new(CollectingSpeaker::default());
        let plain = SpeakerAnnouncer::new(speaker.clone());

        plain.announce(Announcement::Audio(vec![9, 9])).await.unwrap();
        plain
            .announce(Announcement::Speech { text: "bonjour".into(), lang: "fr-FR".into() })
            .await
            .unwrap();
        assert_eq!(speaker.0.lock().unwrap().as_slice(), &[vec![9, 9]]);

        let voiced = SpeakerAnnouncer::new(speaker.clone()).with_synthesizer(Arc::new(EchoSynth));
        voiced
            .announce(Announcement::Speech { text: "ok".into(), lang: "fr-FR".into() })
            .await
            .unwrap();
        assert_eq!(speaker.0.lock().unwrap().last().unwrap(), b"ok");
    }
}
