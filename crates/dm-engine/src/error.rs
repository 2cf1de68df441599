//! Error types for the device management engine.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the device management engine.
///
/// Protocol-level failures never leave the dispatcher as errors; they are
/// turned into response codes there. These variants describe the failures
/// that callers of the public API can observe.
#[derive(Debug, Error)]
pub enum Error {
    /// Publishing or subscribing through the transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport is not connected.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A request handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Resource, channel or handler not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The server answered with a non-success response code.
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// No correlated response arrived in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Worker pool rejected a job.
    #[error("Worker pool error: {0}")]
    Worker(String),

    /// File system failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
