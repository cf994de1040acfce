//! Error taxonomy for the call client.

/// Reasons a caller's registration details are rejected before any request
/// is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("name and phone number are required")]
    MissingField,

    #[error("name is too long (max {max} characters)")]
    NameTooLong { max: usize },

    #[error("phone number must look like \"+212 123456789\"")]
    BadPhone,
}

/// Error type for call operations
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Invalid caller details: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Precondition failed: {0}")]
    Precondition(&'static str),

    #[error("Microphone error: {0}")]
    Device(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        CallError::BackendUnavailable(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CallError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => CallError::TransportClosed,
            other => CallError::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
