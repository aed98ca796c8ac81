//! The debuggee side of the relay
//!
//! Spawning the runtime, reaching its debug server and talking the protocol
//! to it.

pub mod connection;
pub mod process;
pub mod relay;

pub use connection::{Connect, ConnectionManager, RetryPolicy, TcpConnector};
pub use process::{ChildHandle, LaunchSpec, ProcessExit, ProcessSupervisor};
pub use relay::{PendingResponse, ProtocolRelay};
