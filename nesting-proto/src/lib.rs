//! # nesting Proto
//!
//! Message types exchanged over the nesting control socket, plus the
//! length-prefixed framing used to carry them.
//!
//! The messages are declared with `prost` derives directly so the crate has
//! no code-generation step. Field tags are part of the wire contract and must
//! never be reused.

pub mod codec;
mod messages;

pub use codec::{read_message, write_message, FrameError, MAX_MESSAGE_SIZE};
pub use messages::*;
