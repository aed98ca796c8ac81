//! NVList debug relay
//!
//! A debug adapter that sits between an editor's debugging UI and the
//! debugger embedded in the NVList runtime. It starts the runtime through the
//! project's build tools, connects to the runtime's debug server, and relays
//! protocol messages both ways, fixing up sequence numbers on the way back.

pub mod config;
pub mod debuggee;
pub mod protocol;
pub mod session;
pub mod state;

mod error;
mod utils;

#[cfg(test)]
mod test_helpers;

pub use config::{RelayConfig, SessionConfig};
pub use error::{Error, Result};
pub use session::{DebugSession, SessionBuilder};
pub use state::{ConnectionState, SessionState};

/// Install the log subscriber. Logs go to stderr; stdout carries the
/// protocol when running as an adapter executable.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nvlist_debug_relay=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Run one debug session over stdin/stdout until it terminates
pub async fn run(config: SessionConfig, relay_config: RelayConfig) -> Result<()> {
    tracing::info!("Starting NVList debug relay for {:?}", config.project_folder);

    let session = DebugSession::new(config, relay_config);
    let result = session
        .start(tokio::io::stdin(), tokio::io::stdout())
        .await;

    // Whatever ended the loop, don't leave the runtime behind
    session.shutdown().await;
    result
}
