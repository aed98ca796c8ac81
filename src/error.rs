//! Error types for the debug relay

use thiserror::Error;

/// Relay-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to spawn runtime: {0}")]
    Spawn(String),

    #[error("Connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Runtime process exited before the debugger became reachable")]
    ChildExited,

    #[error("Session is shutting down")]
    ShutDown,

    #[error("Gave up connecting after {0} attempts")]
    AttemptsExhausted(u32),

    #[error("Timed out waiting for response to '{0}'")]
    Timeout(String),

    #[error("Relay closed before a response arrived")]
    RelayClosed,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error belongs to the transport-level class that the
    /// connection manager absorbs and retries.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Connect { .. })
    }
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;
