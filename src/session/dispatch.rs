//! Command dispatch table
//!
//! Maps front-end command names to how the facade handles them.

/// What the facade does with a front-end request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Spawn, connect, and forward the original request as the remote handshake
    Handshake,
    /// Forward to the remote and relay its response
    Forward,
    /// Forward best-effort, then shut down without waiting for an answer
    ForwardThenShutdown,
    /// Answer locally with an empty success response
    LocalAck,
    /// Answer with an error response
    Unsupported,
}

/// Commands forwarded to the remote debugger once the session is up
pub const FORWARDED_COMMANDS: &[&str] = &[
    "launch",
    "threads",
    "stackTrace",
    "pause",
    "continue",
    "next",
    "stepIn",
    "stepOut",
    "setBreakpoints",
    "evaluate",
    "setExpression",
    "source",
];

/// Look up the policy for a command
pub fn policy_for(command: &str) -> Policy {
    match command {
        "initialize" => Policy::Handshake,
        "disconnect" => Policy::ForwardThenShutdown,
        "configurationDone" => Policy::LocalAck,
        c if FORWARDED_COMMANDS.contains(&c) => Policy::Forward,
        _ => Policy::Unsupported,
    }
}
