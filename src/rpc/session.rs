//! One authenticated conversation with the Discord client.
//!
//! A [`Session`] performs the handshake, sends commands, and owns a polling
//! thread that turns raw frames into [`Incoming`] values for a single sink.
//! Commands are fire-and-forget: their replies arrive through the sink.
//!
//! ```text
//! callers ──send_command──► writer Transport ──► socket
//!                                                  │
//! sink ◄── Incoming ◄── poll thread (read clone) ◄─┘
//! ```
//!
//! A session is never patched after a failure; the backend builds a new one.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{json, Value};

use super::commands::{cmd, Command, Message};
use super::oauth::{ClientCredentials, TokenExchange, TokenPair};
use crate::constants::{
    CODE_INVALID_CLIENT_ID, HANDSHAKE_ATTEMPTS, HANDSHAKE_REPLY_TIMEOUT, HANDSHAKE_RETRY_DELAY,
    OAUTH_SCOPES, PENDING_NONCE_CAPACITY, RPC_VERSION,
};
use crate::error::{Result, RpcError};
use crate::ipc::{Opcode, Received, Transport};
use crate::lock;

/// What the polling thread hands to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Receive timed out with nothing to read.
    Idle,
    /// A complete frame; `payload` is undecoded JSON text.
    Frame {
        /// Frame opcode.
        opcode: Opcode,
        /// Payload text.
        payload: String,
    },
}

/// Receiver of everything the polling thread reads.
pub type EventSink = Arc<dyn Fn(Incoming) + Send + Sync>;

/// Connection tuning for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Socket directory override; `None` uses the environment chain.
    pub ipc_dir: Option<PathBuf>,
    /// Connect+handshake attempts against a silent peer.
    pub handshake_attempts: u32,
    /// Wait for the handshake reply per attempt.
    pub handshake_timeout: Duration,
    /// Pause between attempts.
    pub handshake_retry_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ipc_dir: None,
            handshake_attempts: HANDSHAKE_ATTEMPTS,
            handshake_timeout: HANDSHAKE_REPLY_TIMEOUT,
            handshake_retry_delay: HANDSHAKE_RETRY_DELAY,
        }
    }
}

/// A command sent and not yet answered.
#[derive(Debug, Clone)]
struct PendingCommand {
    nonce: String,
    cmd: String,
}

/// Handshaken connection plus its polling thread.
pub struct Session {
    credentials: ClientCredentials,
    oauth: Arc<dyn TokenExchange>,
    options: SessionOptions,
    writer: Arc<Mutex<Transport>>,
    polling: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
    pending: Mutex<VecDeque<PendingCommand>>,
    user_id: Mutex<Option<String>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.credentials.client_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Unconnected session for `credentials`.
    pub fn new(
        credentials: ClientCredentials,
        oauth: Arc<dyn TokenExchange>,
        options: SessionOptions,
    ) -> Self {
        let transport = match &options.ipc_dir {
            Some(dir) => Transport::with_base_dir(dir),
            None => Transport::new(),
        };
        Self {
            credentials,
            oauth,
            options,
            writer: Arc::new(Mutex::new(transport)),
            polling: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            user_id: Mutex::new(None),
        }
    }

    /// Connect, handshake, and start polling into `sink`.
    ///
    /// A peer that accepts but stays silent is retried up to
    /// `handshake_attempts` times, since Discord may still be starting.
    ///
    /// # Errors
    ///
    /// - [`RpcError::TransportUnavailable`] if no socket exists
    /// - [`RpcError::InvalidClientId`] on handshake code 4000
    /// - [`RpcError::Protocol`] for any other unexpected reply
    pub fn connect(&self, sink: EventSink) -> Result<()> {
        let result = self.handshake().and_then(|ready| {
            *lock(&self.user_id) = ready.user_id().map(ToString::to_string);
            self.start_polling(sink)
        });
        if result.is_err() {
            lock(&self.writer).disconnect();
        }
        result
    }

    fn handshake(&self) -> Result<Message> {
        let hello = json!({"v": RPC_VERSION, "client_id": self.credentials.client_id});

        for attempt in 1..=self.options.handshake_attempts {
            let reply = {
                let mut transport = lock(&self.writer);
                transport.connect()?;
                transport.send(&hello, Opcode::Handshake)?;
                transport.receive_within(self.options.handshake_timeout)?
            };

            match reply {
                Received::Frame { payload, .. } => {
                    let msg = Message::parse(&payload)?;
                    if msg.code == Some(CODE_INVALID_CLIENT_ID)
                        || msg.error_code() == Some(CODE_INVALID_CLIENT_ID)
                    {
                        return Err(RpcError::InvalidClientId);
                    }
                    if !msg.is_ready() {
                        return Err(RpcError::protocol(format!(
                            "unexpected handshake reply: cmd={:?} evt={:?}",
                            msg.cmd, msg.evt
                        )));
                    }
                    log::info!("[Session] Handshake complete (attempt {attempt})");
                    return Ok(msg);
                }
                Received::Idle | Received::Disconnected => {
                    log::warn!(
                        "[Session] No handshake reply (attempt {attempt}/{})",
                        self.options.handshake_attempts
                    );
                    lock(&self.writer).disconnect();
                    thread::sleep(self.options.handshake_retry_delay);
                }
            }
        }

        Err(RpcError::protocol(format!(
            "no handshake reply after {} attempts",
            self.options.handshake_attempts
        )))
    }

    fn start_polling(&self, sink: EventSink) -> Result<()> {
        let reader = lock(&self.writer).try_clone()?;
        let writer = Arc::clone(&self.writer);
        let polling = Arc::clone(&self.polling);

        polling.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("discord-rpc-poll".to_string())
            .spawn(move || poll_loop(reader, &writer, &polling, &sink));

        match spawned {
            Ok(handle) => {
                *lock(&self.poller) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.polling.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Whether the polling thread is running.
    pub fn is_connected(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// User id from the `READY` payload.
    pub fn user_id(&self) -> Option<String> {
        lock(&self.user_id).clone()
    }

    /// Stop polling and close the socket.
    ///
    /// Joins the polling thread unless called from it.
    pub fn disconnect(&self) {
        self.polling.store(false, Ordering::SeqCst);
        lock(&self.writer).disconnect();
        lock(&self.pending).clear();

        if let Some(handle) = lock(&self.poller).take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(e) = handle.join() {
                log::error!("[Session] Polling thread panicked: {:?}", e);
            }
        }
    }

    /// Send any command envelope.
    pub fn send_command(&self, command: &Command) -> Result<()> {
        let value = command.to_value()?;
        lock(&self.writer).send(&value, Opcode::Frame)?;

        let mut pending = lock(&self.pending);
        if pending.len() >= PENDING_NONCE_CAPACITY {
            if let Some(stale) = pending.pop_front() {
                log::debug!("[Session] No reply seen for {} ({})", stale.cmd, stale.nonce);
            }
        }
        pending.push_back(PendingCommand {
            nonce: command.nonce.clone(),
            cmd: command.cmd.clone(),
        });
        Ok(())
    }

    fn send(&self, name: &str, args: Option<Value>) -> Result<()> {
        let command = match args {
            Some(args) => Command::with_args(name, args),
            None => Command::new(name),
        };
        self.send_command(&command)
    }

    /// Match a reply nonce to the command that produced it.
    ///
    /// Returns the command name and forgets the nonce. `None` means the reply
    /// does not answer anything this session sent (or was already matched).
    pub fn resolve_reply(&self, nonce: &str) -> Option<String> {
        let mut pending = lock(&self.pending);
        let index = pending.iter().position(|p| p.nonce == nonce)?;
        pending.remove(index).map(|p| p.cmd)
    }

    /// Ask the user to authorize; the code arrives as an `AUTHORIZE` reply.
    pub fn authorize(&self) -> Result<()> {
        self.send(
            cmd::AUTHORIZE,
            Some(json!({"client_id": self.credentials.client_id, "scopes": OAUTH_SCOPES})),
        )
    }

    /// Log in with `access_token`, or fall back to [`Session::authorize`].
    pub fn authenticate(&self, access_token: Option<&str>) -> Result<()> {
        match access_token.filter(|t| !t.is_empty()) {
            Some(token) => self.send(cmd::AUTHENTICATE, Some(json!({"access_token": token}))),
            None => self.authorize(),
        }
    }

    /// Exchange an `AUTHORIZE` code for tokens (blocking HTTP).
    pub fn get_access_token(&self, code: &str) -> Result<TokenPair> {
        self.oauth.exchange_code(&self.credentials, code)
    }

    /// Refresh tokens (blocking HTTP).
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        self.oauth.refresh(&self.credentials, refresh_token)
    }

    /// Subscribe to `event`.
    pub fn subscribe(&self, event: &str, args: Option<Value>) -> Result<()> {
        self.send_command(&Command::subscription(cmd::SUBSCRIBE, event, args))
    }

    /// Unsubscribe from `event`.
    pub fn unsubscribe(&self, event: &str, args: Option<Value>) -> Result<()> {
        self.send_command(&Command::subscription(cmd::UNSUBSCRIBE, event, args))
    }

    /// `SET_VOICE_SETTINGS` with a partial settings object.
    pub fn set_voice_settings(&self, settings: Value) -> Result<()> {
        self.send(cmd::SET_VOICE_SETTINGS, Some(settings))
    }

    /// `GET_VOICE_SETTINGS`.
    pub fn get_voice_settings(&self) -> Result<()> {
        self.send(cmd::GET_VOICE_SETTINGS, None)
    }

    /// Join `channel_id`, or leave voice with `None`.
    pub fn select_voice_channel(&self, channel_id: Option<&str>, force: bool) -> Result<()> {
        self.send(
            cmd::SELECT_VOICE_CHANNEL,
            Some(json!({"channel_id": channel_id, "force": force})),
        )
    }

    /// Focus a text channel.
    pub fn select_text_channel(&self, channel_id: &str) -> Result<()> {
        self.send(cmd::SELECT_TEXT_CHANNEL, Some(json!({"channel_id": channel_id})))
    }

    /// `GET_SELECTED_VOICE_CHANNEL`.
    pub fn get_selected_voice_channel(&self) -> Result<()> {
        self.send(cmd::GET_SELECTED_VOICE_CHANNEL, None)
    }

    /// `GET_CHANNEL` for `channel_id`.
    pub fn get_channel(&self, channel_id: &str) -> Result<()> {
        self.send(cmd::GET_CHANNEL, Some(json!({"channel_id": channel_id})))
    }

    /// Set another user's local volume.
    pub fn set_user_voice_settings(&self, user_id: &str, volume: u16) -> Result<()> {
        self.send(
            cmd::SET_USER_VOICE_SETTINGS,
            Some(json!({"user_id": user_id, "volume": volume})),
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Body of the polling thread.
fn poll_loop(
    mut reader: Transport,
    writer: &Mutex<Transport>,
    polling: &AtomicBool,
    sink: &EventSink,
) {
    log::debug!("[Session] Polling started");

    while polling.load(Ordering::SeqCst) {
        match reader.receive() {
            Ok(Received::Idle) => sink(Incoming::Idle),
            Ok(Received::Frame {
                opcode: Opcode::Ping,
                payload,
            }) => {
                if let Err(e) = lock(writer).send_raw(payload.as_bytes(), Opcode::Pong) {
                    log::warn!("[Session] Failed to answer ping: {e}");
                }
            }
            Ok(Received::Frame { opcode, payload }) => sink(Incoming::Frame { opcode, payload }),
            Ok(Received::Disconnected) => {
                log::info!("[Session] Discord closed the connection");
                break;
            }
            Err(RpcError::Protocol(reason)) if reader.is_open() => {
                log::error!("[Session] Dropping malformed frame: {reason}");
            }
            Err(e) => {
                if polling.load(Ordering::SeqCst) {
                    log::error!("[Session] Receive failed: {e}");
                }
                break;
            }
        }
    }

    polling.store(false, Ordering::SeqCst);
    reader.disconnect();
    lock(writer).disconnect();
    log::debug!("[Session] Polling stopped");
}
