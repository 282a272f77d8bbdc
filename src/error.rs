//! Error types for the tick stream service

use thiserror::Error;

/// Tick stream errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TickStreamError {
    #[error("Request timed out after {0} ms")]
    TransportTimeout(u64),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Upstream error [{code}]: {message}")]
    UpstreamError { code: String, message: String },

    #[error("Backfill failed for {symbol}: {reason}")]
    BackfillFailure { symbol: String, reason: String },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Unknown instrument: {0:?}")]
    UnknownInstrument(String),

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TickStreamError {
    /// Whether the failure came from the connection rather than the request itself
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TickStreamError::TransportTimeout(_)
                | TickStreamError::TransportUnavailable(_)
                | TickStreamError::StreamInterrupted(_)
                | TickStreamError::WebSocket(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TickStreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TickStreamError::WebSocket(err.to_string())
    }
}

impl From<serde_json::Error> for TickStreamError {
    fn from(err: serde_json::Error) -> Self {
        TickStreamError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for TickStreamError {
    fn from(err: std::io::Error) -> Self {
        TickStreamError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TickStreamError>;
