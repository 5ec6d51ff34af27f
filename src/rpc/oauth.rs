//! OAuth token exchange against Discord's token endpoint.
//!
//! [`TokenExchange`] is the seam the session uses for the two grants it needs
//! (`authorization_code` after `AUTHORIZE`, `refresh_token` after a 4006/4009
//! reply). [`HttpTokenExchange`] is the real implementation; it keeps one
//! pooled blocking client for the life of the process.

use std::fmt;

use reqwest::blocking::Client;
use serde_json::Value;

use crate::constants::{OAUTH_REQUEST_TIMEOUT, OAUTH_TOKEN_URL};
use crate::error::{Result, RpcError};

/// Operator-supplied application credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    /// Application (client) id.
    pub client_id: String,
    /// Application secret.
    pub client_secret: String,
}

impl ClientCredentials {
    /// Build credentials, rejecting empty values.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MissingCredentials`] if either value is empty.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Result<Self> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        if client_id.trim().is_empty() || client_secret.trim().is_empty() {
            return Err(RpcError::MissingCredentials);
        }
        Ok(Self {
            client_id,
            client_secret,
        })
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Tokens returned by a successful grant.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    /// Bearer token for `AUTHENTICATE`.
    pub access_token: String,
    /// Token for the next refresh, when the endpoint issued one.
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair").finish_non_exhaustive()
    }
}

/// Performs OAuth grants for a client.
pub trait TokenExchange: Send + Sync {
    /// Exchange an `AUTHORIZE` code for tokens.
    fn exchange_code(&self, client: &ClientCredentials, code: &str) -> Result<TokenPair>;

    /// Trade a refresh token for a new pair.
    fn refresh(&self, client: &ClientCredentials, refresh_token: &str) -> Result<TokenPair>;
}

/// [`TokenExchange`] over HTTPS with a shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpTokenExchange {
    client: Client,
    token_url: String,
}

impl HttpTokenExchange {
    /// Client for the production token endpoint.
    pub fn new() -> Result<Self> {
        Self::with_url(OAUTH_TOKEN_URL)
    }

    /// Client for a custom token endpoint.
    pub fn with_url(token_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(OAUTH_REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            token_url: token_url.into(),
        })
    }

    /// Endpoint this client posts to.
    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    fn post(&self, form: &[(&str, &str)]) -> Result<TokenPair> {
        let response = self.client.post(&self.token_url).form(form).send()?;
        let status = response.status();
        let body: Value = response.json()?;

        match body.get("access_token").and_then(Value::as_str) {
            Some(access_token) => Ok(TokenPair {
                access_token: access_token.to_string(),
                refresh_token: body
                    .get("refresh_token")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            }),
            None => {
                let reason = body
                    .get("error_description")
                    .or_else(|| body.get("error"))
                    .and_then(Value::as_str)
                    .map_or_else(|| format!("no access_token in response ({status})"), ToString::to_string);
                Err(RpcError::OAuthExchangeFailed(reason))
            }
        }
    }
}

impl TokenExchange for HttpTokenExchange {
    fn exchange_code(&self, client: &ClientCredentials, code: &str) -> Result<TokenPair> {
        log::debug!("[OAuth] Exchanging authorization code");
        self.post(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &client.client_id),
            ("client_secret", &client.client_secret),
        ])
    }

    fn refresh(&self, client: &ClientCredentials, refresh_token: &str) -> Result<TokenPair> {
        log::debug!("[OAuth] Refreshing access token");
        self.post(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &client.client_id),
            ("client_secret", &client.client_secret),
        ])
    }
}
