//! Error taxonomy for the RPC client.
//!
//! Every fallible library operation returns [`RpcError`]. Session expiry is
//! handled inside [`crate::Backend`] and never reaches callers; everything else
//! is propagated with `?` or reported through the auth-completion callback.

use thiserror::Error;

/// Errors raised by the transport, session and backend layers.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No IPC socket accepted a connection; Discord is probably not running.
    #[error("could not find a Discord IPC socket, is Discord running?")]
    TransportUnavailable,

    /// The handshake was rejected with code 4000.
    #[error("invalid client id, check the application id in the developer portal")]
    InvalidClientId,

    /// The peer sent something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The token endpoint did not return an access token.
    #[error("OAuth token exchange failed: {0}")]
    OAuthExchangeFailed(String),

    /// The access token was rejected (codes 4006/4009).
    #[error("session expired (code {0})")]
    SessionExpired(i64),

    /// Client id or client secret is empty.
    #[error("client id and client secret are required")]
    MissingCredentials,

    /// No connected session; a reconnect has been scheduled.
    #[error("not connected to Discord yet, reconnect in progress")]
    NotReady,

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport failure talking to the token endpoint.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl RpcError {
    /// Build a [`RpcError::Protocol`] from anything displayable.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
