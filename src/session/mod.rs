//! Session facade: the single entry point for the front end

mod debug_session;
pub mod dispatch;
mod outbound;

pub use debug_session::{DebugSession, SessionBuilder};
pub use dispatch::Policy;
pub use outbound::{Outbound, OutboundRx};
