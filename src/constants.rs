//! Application-wide constants for voicedeck.
//!
//! Timeouts, retry budgets, endpoints and protocol codes live here so the
//! transport, session and backend layers agree on them.
//!
//! # Categories
//!
//! - **Socket**: IPC discovery and receive timing
//! - **Handshake**: connect retry budget
//! - **OAuth**: token endpoint and HTTP timeout
//! - **Protocol codes**: error codes carried in reply payloads

use std::time::Duration;

// ============================================================================
// Socket
// ============================================================================

/// Socket file name prefix; candidates are `<base>/discord-ipc-0` .. `-9`.
pub const IPC_SOCKET_PREFIX: &str = "discord-ipc-";

/// Number of numbered IPC socket candidates probed on connect.
pub const IPC_SOCKET_CANDIDATES: u8 = 10;

/// Environment variables consulted, in order, for the socket base directory.
pub const IPC_BASE_DIR_VARS: [&str; 4] = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"];

/// Base directory used when none of [`IPC_BASE_DIR_VARS`] is set.
pub const IPC_FALLBACK_DIR: &str = "/tmp";

/// Receive timeout for the polling loop.
///
/// Also bounds how long a stop request can go unnoticed by the poller.
pub const SOCKET_RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on how long a partially received frame may take to complete.
pub const FRAME_COMPLETION_DEADLINE: Duration = Duration::from_secs(5);

/// Write timeout for outbound frames.
pub const SOCKET_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest payload accepted from the peer (16 MB).
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

// ============================================================================
// Handshake
// ============================================================================

/// RPC protocol version sent in the handshake.
pub const RPC_VERSION: u32 = 1;

/// Connect+handshake attempts before giving up on a silent peer.
pub const HANDSHAKE_ATTEMPTS: u32 = 5;

/// How long to wait for the handshake reply on each attempt.
pub const HANDSHAKE_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between handshake attempts.
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// OAuth scopes requested by `AUTHORIZE`.
pub const OAUTH_SCOPES: [&str; 2] = ["rpc", "identify"];

// ============================================================================
// OAuth
// ============================================================================

/// Token endpoint for code exchange and refresh.
pub const OAUTH_TOKEN_URL: &str = "https://discord.com/api/oauth2/token";

/// HTTP timeout for token endpoint requests.
pub const OAUTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Protocol codes
// ============================================================================

/// Handshake rejected: the client id is unknown.
pub const CODE_INVALID_CLIENT_ID: i64 = 4000;

/// Reply codes meaning the access token is no longer accepted.
pub const SESSION_EXPIRED_CODES: [i64; 2] = [4006, 4009];

/// Returns true if `code` requires a token refresh.
pub fn is_session_expired(code: i64) -> bool {
    SESSION_EXPIRED_CODES.contains(&code)
}

// ============================================================================
// Voice
// ============================================================================

/// Maximum per-user volume accepted by `SET_USER_VOICE_SETTINGS`.
pub const MAX_USER_VOLUME: u16 = 200;

/// Commands waiting for a reply that are remembered for nonce correlation.
pub const PENDING_NONCE_CAPACITY: usize = 64;

// ============================================================================
// CLI
// ============================================================================

/// How long the CLI waits for authentication, including the user approving
/// the authorization prompt in Discord.
pub const CLI_AUTH_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval at which `voicedeck watch` checks the connection.
pub const CLI_WATCH_TICK: Duration = Duration::from_secs(1);
