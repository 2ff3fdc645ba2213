//! The framed protocol spoken between `cdevd` and its container agents.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Commands (HELLO, UEVENT, ...)    │  Message
//! ├─────────────────────────────────────────┤
//! │               Framing                   │  Length-prefixed
//! ├─────────────────────────────────────────┤
//! │            UDS Transport                │  Unix stream socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! Messages on one connection are FIFO. Server-originated commands are
//! uppercase, client-originated lowercase; see [`command`].

mod framing;
mod message;

pub use framing::{MessageCodec, ProtocolError, MAX_FRAME_SIZE};
pub use message::{command, encode_sync, parse_sync, Message};
