//! Unix domain socket layer for the Discord RPC protocol.
//!
//! # Wire Protocol
//!
//! Fixed 8-byte header `[i32 LE opcode][i32 LE length]` followed by `length`
//! bytes of UTF-8 JSON. See [`framing`] for the codec and [`transport`] for
//! socket discovery and timed receive.

pub mod framing;
pub mod transport;

pub use framing::Opcode;
pub use transport::{Received, Transport};
