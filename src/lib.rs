//! Callbot - voice client for an AI call center
//!
//! Registers a caller with the backend, then runs a strict turn-taking voice
//! call over a WebSocket: the AI speaks, the caller is recorded for a bounded
//! time, the recording is sent as one binary frame, and so on until the call
//! ends or is escalated to a human agent.

#![forbid(unsafe_code)]

pub mod announce;
pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod media_in;
pub mod playback;
pub mod presenter;
pub mod protocol;
pub mod registration;
pub mod runner;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use error::{CallError, Result};
pub use runner::{CallController, CallHandle, CallParts};
pub use session::{CallSession, CallState};
