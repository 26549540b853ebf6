//! Error types for the Beacon call client

use thiserror::Error;

/// Result type alias for call client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the call client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access denied
    #[error("permission denied: {0}")]
    Permission(String),

    /// Capture or output device missing or failed
    #[error("device error: {0}")]
    Device(String),

    /// Handshake failure, unexpected close or network error
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed audio buffer or inbound message
    #[error("format error: {0}")]
    Format(String),

    /// Operation attempted in a state that does not allow it
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// WAV encoding or decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the reconnect backoff should handle this error
    ///
    /// Permission errors need the user to act first, so they never retry
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::WebSocket(_) | Self::Http(_) | Self::Io(_)
        )
    }
}
