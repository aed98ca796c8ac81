//! Session and connection state

use serde::Serialize;

/// Lifecycle of a debug session
///
/// `Uninitialized → Initializing → HandshakeWait → Active`, and from any of
/// those `→ ShuttingDown → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    /// Runtime spawned, connecting to its debug server
    Initializing,
    /// Connected; waiting for the remote's initialize response
    HandshakeWait,
    Active,
    ShuttingDown,
    Terminated,
}

impl SessionState {
    /// Shutdown has begun or finished
    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::ShuttingDown | SessionState::Terminated)
    }
}

/// Transport to the remote debugger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}
