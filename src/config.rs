//! Configuration loading and persistence for the `voicedeck` binary.
//!
//! Reads `<config_dir>/config.json`, then applies `VOICEDECK_*` environment
//! overrides. OAuth tokens are kept separately by
//! [`crate::settings::FileTokenStore`] in the same directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::{
    fmt,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

use crate::constants::OAUTH_TOKEN_URL;

/// Configuration for the voicedeck CLI.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    /// Discord application id.
    #[serde(default)]
    pub client_id: String,
    /// Discord application secret.
    #[serde(default)]
    pub client_secret: String,
    /// Directory holding `discord-ipc-N`; unset means discover from the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc_dir: Option<PathBuf>,
    /// OAuth token endpoint.
    #[serde(default = "default_token_url")]
    pub oauth_token_url: String,
}

fn default_token_url() -> String {
    OAUTH_TOKEN_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            ipc_dir: None,
            oauth_token_url: default_token_url(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("ipc_dir", &self.ipc_dir)
            .field("oauth_token_url", &self.oauth_token_url)
            .finish()
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `VOICEDECK_CONFIG_DIR` wins; otherwise the platform config dir
    /// (e.g. `~/.config/voicedeck`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("VOICEDECK_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("voicedeck")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_env_overrides(|var| std::env::var(var).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir`; a missing file yields defaults.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(client_id) = lookup("VOICEDECK_CLIENT_ID") {
            self.client_id = client_id;
        }
        if let Some(client_secret) = lookup("VOICEDECK_CLIENT_SECRET") {
            self.client_secret = client_secret;
        }
        if let Some(ipc_dir) = lookup("VOICEDECK_IPC_DIR").filter(|d| !d.is_empty()) {
            self.ipc_dir = Some(PathBuf::from(ipc_dir));
        }
        if let Some(url) = lookup("VOICEDECK_OAUTH_URL").filter(|u| !u.is_empty()) {
            self.oauth_token_url = url;
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Writes `config.json` into `dir`, readable only by the owner.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join("config.json");
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        // Set restrictive permissions (owner read/write only) before the secret lands
        #[cfg(unix)]
        file.set_permissions(fs::Permissions::from_mode(0o600))?;

        file.write_all(serde_json::to_string_pretty(self)?.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Whether both application credentials are set.
    pub fn has_credentials(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}
