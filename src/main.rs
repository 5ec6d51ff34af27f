//! voicedeck CLI - drive Discord voice controls from the command line.
//!
//! This is the main binary entry point. See the `voicedeck` library for the
//! protocol client.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use voicedeck::config::Config;
use voicedeck::constants::{CLI_AUTH_TIMEOUT, CLI_WATCH_TICK, MAX_USER_VOLUME};
use voicedeck::rpc::commands::{evt, VOICE_STATE_EVENTS};
use voicedeck::{
    AuthOutcome, Backend, BackendOptions, EventCallback, FileTokenStore, HttpTokenExchange,
    VoiceMode,
};

// CLI
#[derive(Parser)]
#[command(name = "voicedeck")]
#[command(version)]
#[command(about = "Control Discord voice state over the local RPC socket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mute or unmute the microphone
    Mute {
        /// on or off
        state: Toggle,
    },
    /// Deafen or undeafen
    Deafen {
        /// on or off
        state: Toggle,
    },
    /// Switch input mode
    Ptt {
        /// push-to-talk or voice-activity
        mode: Mode,
    },
    /// Join a voice channel
    Voice {
        /// Channel id
        channel_id: String,
    },
    /// Leave the current voice channel
    Leave,
    /// Focus a text channel
    Text {
        /// Channel id
        channel_id: String,
    },
    /// Set another user's local volume
    Volume {
        /// User id
        user_id: String,
        /// Volume, 0-200 (100 is normal)
        #[arg(value_parser = clap::value_parser!(u16).range(0..=i64::from(MAX_USER_VOLUME)))]
        volume: u16,
    },
    /// Print voice events as JSON until interrupted
    Watch,
    /// Authenticate (approving the prompt in Discord if needed) and exit
    Login,
    /// Save application credentials to the config file
    Configure {
        /// Discord application id
        #[arg(long)]
        client_id: String,
        /// Discord application secret
        #[arg(long)]
        client_secret: String,
        /// Directory holding the discord-ipc-N sockets
        #[arg(long)]
        ipc_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    PushToTalk,
    VoiceActivity,
}

impl From<Mode> for VoiceMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::PushToTalk => Self::PushToTalk,
            Mode::VoiceActivity => Self::VoiceActivity,
        }
    }
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    // VOICEDECK_LOG_FILE redirects logs so `watch` output stays clean
    if let Ok(path) = std::env::var("VOICEDECK_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn build_backend(config: &Config) -> Result<Backend> {
    let store = Arc::new(FileTokenStore::in_dir(&Config::config_dir()?));
    let oauth = Arc::new(
        HttpTokenExchange::with_url(config.oauth_token_url.clone())
            .context("Failed to build HTTP client")?,
    );

    let mut options = BackendOptions::new(store, oauth);
    if let Some(dir) = &config.ipc_dir {
        options = options.with_ipc_dir(dir);
    }
    Ok(Backend::new(options))
}

/// Connect, authenticate, and wait for the outcome.
fn authenticate(backend: &Backend, config: &Config) -> Result<()> {
    let (tx, rx) = mpsc::channel::<AuthOutcome>();
    let tx = Mutex::new(tx);
    backend.set_auth_listener(move |outcome| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(outcome);
        }
    });

    backend.update_credentials(&config.client_id, &config.client_secret, None, None)?;

    match rx.recv_timeout(CLI_AUTH_TIMEOUT) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => bail!("Authentication failed: {reason}"),
        Err(_) => bail!(
            "No answer from Discord after {}s (was the authorization prompt approved?)",
            CLI_AUTH_TIMEOUT.as_secs()
        ),
    }
}

/// Print every voice event, following the user between voice channels.
fn watch(backend: &Backend) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::flag;
        flag::register(SIGINT, Arc::clone(&shutdown))?;
        flag::register(SIGTERM, Arc::clone(&shutdown))?;
    }

    let printer = |key: &'static str| -> EventCallback {
        Arc::new(move |data: &Value| println!("{}", json!({"evt": key, "data": data})))
    };
    for key in [evt::VOICE_SETTINGS_UPDATE, evt::VOICE_CHANNEL_SELECT]
        .into_iter()
        .chain(VOICE_STATE_EVENTS)
    {
        backend.register_callback(key, printer(key));
    }

    // Voice-state events are per channel; move the subscription along with the user.
    let watched: Arc<Mutex<Option<String>>> = Arc::default();
    let follower = {
        let backend = backend.clone();
        let watched = Arc::clone(&watched);
        Arc::new(move |data: &Value| {
            let channel = data
                .get("channel_id")
                .or_else(|| data.get("id"))
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let Ok(mut watched) = watched.lock() else {
                return;
            };
            if *watched == channel {
                return;
            }
            if let Some(old) = watched.take() {
                if let Err(e) = backend.unsubscribe_voice_states(&old) {
                    log::warn!("Failed to unsubscribe from {old}: {e}");
                }
            }
            if let Some(new) = &channel {
                if let Err(e) = backend.subscribe_voice_states(new) {
                    log::warn!("Failed to subscribe to {new}: {e}");
                }
            }
            *watched = channel;
        })
    };
    backend.register_callback(evt::VOICE_CHANNEL_SELECT, follower);

    backend.request_current_voice_channel()?;
    backend.get_voice_settings()?;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(CLI_WATCH_TICK);
        if !backend.is_connected() {
            if let Ok(mut watched) = watched.lock() {
                *watched = None;
            }
            // NotReady here schedules the reconnect; AUTHENTICATE re-syncs.
            let _ = backend.request_current_voice_channel();
        }
    }
    Ok(())
}

/// Write credentials into the stored config, keeping its other fields.
fn configure(client_id: String, client_secret: String, ipc_dir: Option<PathBuf>) -> Result<()> {
    let dir = Config::config_dir()?;
    let mut config = Config::load_from(&dir)?;
    config.client_id = client_id;
    config.client_secret = client_secret;
    if ipc_dir.is_some() {
        config.ipc_dir = ipc_dir;
    }
    if !config.has_credentials() {
        bail!("client id and client secret must not be empty");
    }
    config.save()?;
    println!("Saved credentials to {}", dir.join("config.json").display());
    Ok(())
}

fn run(backend: &Backend, command: Commands) -> Result<()> {
    match command {
        Commands::Mute { state } => backend.set_mute(state.is_on())?,
        Commands::Deafen { state } => backend.set_deafen(state.is_on())?,
        Commands::Ptt { mode } => backend.set_push_to_talk(mode.into())?,
        Commands::Voice { channel_id } => backend.change_voice_channel(Some(&channel_id))?,
        Commands::Leave => backend.change_voice_channel(None)?,
        Commands::Text { channel_id } => backend.change_text_channel(&channel_id)?,
        Commands::Volume { user_id, volume } => backend.set_user_volume(&user_id, volume)?,
        Commands::Watch => watch(backend)?,
        Commands::Login => match backend.current_user_id() {
            Some(id) => println!("Authenticated as user {id}"),
            None => println!("Authenticated"),
        },
        Commands::Configure { .. } => {}
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    if let Commands::Configure {
        client_id,
        client_secret,
        ipc_dir,
    } = cli.command
    {
        return configure(client_id, client_secret, ipc_dir);
    }

    let config = Config::load()?;
    if !config.has_credentials() {
        bail!(
            "No client credentials. Set client_id and client_secret in {} or export VOICEDECK_CLIENT_ID and VOICEDECK_CLIENT_SECRET.",
            Config::config_dir()?.join("config.json").display()
        );
    }

    let backend = build_backend(&config)?;
    let result = authenticate(&backend, &config).and_then(|()| run(&backend, cli.command));
    backend.close();
    result
}
