//! Wire protocol spoken on both sides of the relay
//!
//! The front end and the remote debugger inside the runtime use the same
//! message envelope and framing.

pub mod codec;
mod message;

pub use codec::{read_frame, write_message, Frame};
pub use message::{Event, Message, Request, Response};
