//! voicedeck - control a running Discord client over its local RPC socket.
//!
//! # Architecture
//!
//! Three layers, leaf first:
//!
//! - **Transport** ([`ipc`]) - framed bytes over the `discord-ipc-N` Unix socket
//! - **Session** ([`rpc`]) - handshake, authorization, commands, polling thread
//! - **Backend** ([`backend`]) - recovery state machine, callback registry, and
//!   the public command surface
//!
//! ```text
//! caller ─► Backend ─► Session ─► Transport ─► socket
//! socket ─► Transport ─► Session poll thread ─► Backend ─► callbacks
//! ```
//!
//! # Modules
//!
//! - [`settings`] - token persistence collaborator
//! - [`config`] - configuration for the `voicedeck` binary
//! - [`constants`] - timeouts, endpoints, and protocol codes

pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod ipc;
pub mod rpc;
pub mod settings;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export commonly used types
pub use backend::{AuthOutcome, Backend, BackendOptions, CallbackHandle, EventCallback, SessionState};
pub use error::{Result, RpcError};
pub use rpc::{HttpTokenExchange, TokenExchange, VoiceMode};
pub use settings::{FileTokenStore, MemoryTokenStore, TokenStore, Tokens};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
