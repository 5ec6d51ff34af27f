//! Persistent OAuth token storage.
//!
//! The backend reads tokens once per [`TokenStore::load`] and writes the whole
//! pair whenever either token changes. Client credentials are not stored here;
//! they are operator configuration (see [`crate::config`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::lock;

/// Owner read/write only.
#[cfg(unix)]
const TOKEN_FILE_MODE: u32 = 0o600;

/// Access/refresh token pair as persisted.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    /// Bearer token for `AUTHENTICATE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Token used to obtain a new access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Tokens {
    /// Pair from optional values; empty strings count as absent.
    pub fn new(access_token: Option<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.filter(|t| !t.is_empty()),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
        }
    }

    /// Whether neither token is known.
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

impl fmt::Debug for Tokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokens")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Settings collaborator that keeps tokens across runs.
pub trait TokenStore: Send + Sync {
    /// Stored tokens; empty if none were ever saved.
    fn load(&self) -> Result<Tokens>;

    /// Replace the stored tokens.
    fn save(&self, tokens: &Tokens) -> Result<()>;
}

/// Tokens in a JSON file, readable only by the owner.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/tokens.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("tokens.json"))
    }

    /// File this store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Tokens> {
        if !self.path.exists() {
            log::debug!("[Tokens] No token file at {}, starting without tokens", self.path.display());
            return Ok(Tokens::default());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, tokens: &Tokens) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(TOKEN_FILE_MODE);
        let mut file = options.open(&self.path)?;

        // mode() only applies on creation; tighten a pre-existing file before writing
        #[cfg(unix)]
        file.set_permissions(fs::Permissions::from_mode(TOKEN_FILE_MODE))?;

        file.write_all(serde_json::to_string_pretty(tokens)?.as_bytes())?;

        log::debug!("[Tokens] Saved tokens to {}", self.path.display());
        Ok(())
    }
}

/// In-process store, for hosts that persist tokens themselves and for tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<Tokens>,
    saves: Mutex<Vec<Tokens>>,
}

impl MemoryTokenStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `tokens`.
    pub fn with_tokens(tokens: Tokens) -> Self {
        Self {
            tokens: Mutex::new(tokens),
            saves: Mutex::default(),
        }
    }

    /// Every pair passed to [`TokenStore::save`], oldest first.
    pub fn saves(&self) -> Vec<Tokens> {
        lock(&self.saves).clone()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Tokens> {
        Ok(lock(&self.tokens).clone())
    }

    fn save(&self, tokens: &Tokens) -> Result<()> {
        *lock(&self.tokens) = tokens.clone();
        lock(&self.saves).push(tokens.clone());
        Ok(())
    }
}
