//! Error types for pixelbus.

use thiserror::Error;

/// Main error type for bus and stream operations.
///
/// Every error is contained at the boundary nearest its origin: a failed
/// handler never aborts the envelope it arrived in, a malformed control-bus
/// line never tears down its connection, and nothing propagates far enough
/// to stop the scheduler.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (control bus lines).
    ///
    /// The offending line is dropped and logged; the connection survives.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A `set`/`get`/`action` referenced a key with no registered handler.
    #[error("no handler registered for key: {0}")]
    UnknownKey(String),

    /// A setter or getter failed.
    ///
    /// Caught per key so one failing handler does not prevent the rest of
    /// the envelope from completing.
    #[error("handler error: {0}")]
    Handler(String),

    /// Malformed binary frame from the pixel stream. Fatal to that session.
    #[error("frame decode error: {0}")]
    Decode(String),

    /// Protocol violation during the stream handshake.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection closed while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// A call for this key is already awaiting its response.
    #[error("a call for key {0:?} is already pending")]
    CallPending(String),

    /// No response arrived for a pending call within the timeout.
    #[error("call for key {0:?} timed out")]
    CallTimeout(String),
}

impl Error {
    /// Wrap an arbitrary handler failure.
    pub fn handler(msg: impl Into<String>) -> Self {
        Error::Handler(msg.into())
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
