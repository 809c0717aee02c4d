//! Error types for rsocket-engine.

use thiserror::Error;

use crate::protocol::error_codes;

/// Main error type for all connection and stream operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (payload codec).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (invalid frame, wrong flags, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error raised by an application handler while producing values.
    ///
    /// Displays as the bare message so it can be sent verbatim in ERROR frames.
    #[error("{0}")]
    Application(String),

    /// ERROR frame received from the peer for a stream.
    #[error("{message}")]
    Remote {
        /// Error code carried by the ERROR frame.
        code: u32,
        /// Textual error data.
        message: String,
    },

    /// The interaction model is not implemented by the responder.
    #[error("{0} not implemented")]
    Unsupported(&'static str),

    /// Request refused because the responder is at capacity.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Stream was cancelled before reaching a terminal signal.
    #[error("Stream cancelled")]
    Cancelled,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl RSocketError {
    /// Build an application error from anything printable.
    pub fn application(message: impl std::fmt::Display) -> Self {
        RSocketError::Application(message.to_string())
    }

    /// ERROR frame code used when this error terminates a stream.
    pub fn error_code(&self) -> u32 {
        match self {
            RSocketError::Rejected(_) => error_codes::REJECTED,
            RSocketError::Cancelled => error_codes::CANCELED,
            _ => error_codes::APPLICATION_ERROR,
        }
    }
}

/// Result type alias using RSocketError.
pub type Result<T> = std::result::Result<T, RSocketError>;
