//! Discord RPC protocol on top of [`crate::ipc`].
//!
//! - [`commands`]: command/event names, outbound envelopes, inbound messages
//! - [`oauth`]: token endpoint grants
//! - [`session`]: handshake, command sending, and the polling thread

pub mod commands;
pub mod oauth;
pub mod session;

pub use commands::{Command, Message, VoiceMode};
pub use oauth::{ClientCredentials, HttpTokenExchange, TokenExchange, TokenPair};
pub use session::{EventSink, Incoming, Session, SessionOptions};
