//! Microphone sources

#[cfg(feature = "pulse")]
pub mod pulse;
pub mod wav;

#[cfg(feature = "pulse")]
pub use pulse::PulseMicrophone;
pub use wav::WavFileMicrophone;

use crate::capture::{MicStream, Microphone};
use crate::error::{CallError, Result};
use async_trait::async_trait;

/// Stand-in used when no capture backend is available. Every recording
/// fails with a device error, which the call treats like a denied mic.
#[derive(Debug, Default)]
pub struct UnavailableMicrophone;

#[async_trait]
impl Microphone for UnavailableMicrophone {
    async fn open(&self) -> Result<Box<dyn MicStream>> {
        Err(CallError::Device(
            "no microphone backend in this build (set CALLBOT_MIC_WAV or enable the `pulse` feature)"
                .to_string(),
        ))
    }
}
