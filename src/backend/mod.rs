//! Connection manager: one recoverable, authenticated session plus the
//! public command and callback surface.
//!
//! # Architecture
//!
//! ```text
//! Backend (cloneable handle)
//!   └── Inner
//!         ├── state: credentials, tokens, current Session, reconnect guard
//!         ├── registry: event key -> callbacks
//!         └── auth listener
//!
//! Session poll thread ──Incoming──► Inner::handle_incoming ──► callbacks
//! ```
//!
//! # Recovery
//!
//! - Socket loss: the next command returns [`RpcError::NotReady`] and starts
//!   one background reconnect (single-flight through the reconnect guard).
//! - Codes 4006/4009: refresh the access token and re-authenticate, or
//!   re-authorize from scratch when no refresh token is usable.
//!
//! Sessions are never patched: every reconnect builds a new [`Session`] and
//! bumps a generation counter so events from a replaced session are ignored.
//!
//! Commands are fire-and-forget. A command rejected with `NotReady` is not
//! replayed after the reconnect; callers retry.
//!
//! # Locking
//!
//! `registry` is always taken before `state` when both are needed. User
//! callbacks and socket writes happen after both are released.

pub mod registry;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use serde_json::{json, Value};

pub use registry::{CallbackHandle, CallbackRegistry, EventCallback};

use crate::constants::{is_session_expired, MAX_USER_VOLUME};
use crate::error::{Result, RpcError};
use crate::ipc::Opcode;
use crate::lock;
use crate::rpc::commands::{cmd, evt, is_subscribable, Message, VoiceMode, VOICE_STATE_EVENTS};
use crate::rpc::oauth::{ClientCredentials, TokenExchange};
use crate::rpc::session::{EventSink, Incoming, Session, SessionOptions};
use crate::settings::{TokenStore, Tokens};

/// Outcome of an authentication attempt: `Err` carries a human-readable reason.
pub type AuthOutcome = std::result::Result<(), String>;

/// Receives every authentication outcome.
pub type AuthListener = Arc<dyn Fn(AuthOutcome) + Send + Sync>;

/// Where the backend is in bringing up a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session.
    Idle,
    /// Connecting and handshaking.
    Connecting,
    /// Handshake accepted, nothing sent yet.
    HandshakeReady,
    /// Waiting for the user to approve `AUTHORIZE`.
    Authorizing,
    /// `AUTHENTICATE` sent.
    Authenticating,
    /// Commands and subscriptions are live.
    Authenticated,
}

/// Collaborators and tuning for a [`Backend`].
#[derive(Clone)]
pub struct BackendOptions {
    /// Where tokens are loaded from and saved to.
    pub token_store: Arc<dyn TokenStore>,
    /// OAuth grant implementation.
    pub oauth: Arc<dyn TokenExchange>,
    /// Settings for every session the backend builds.
    pub session: SessionOptions,
}

impl std::fmt::Debug for BackendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendOptions")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl BackendOptions {
    /// Options with default session settings.
    pub fn new(token_store: Arc<dyn TokenStore>, oauth: Arc<dyn TokenExchange>) -> Self {
        Self {
            token_store,
            oauth,
            session: SessionOptions::default(),
        }
    }

    /// Probe sockets under `dir` instead of the environment chain.
    #[must_use]
    pub fn with_ipc_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session.ipc_dir = Some(dir.into());
        self
    }

    /// Replace the session settings.
    #[must_use]
    pub fn with_session_options(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }
}

struct State {
    credentials: Option<ClientCredentials>,
    tokens: Tokens,
    session: Option<Arc<Session>>,
    /// Bumped whenever the session is replaced or closed.
    generation: u64,
    authed: bool,
    /// Reconnect guard.
    reconnecting: bool,
    phase: SessionState,
    voice_channel: Option<String>,
    user_id: Option<String>,
}

struct Inner {
    options: BackendOptions,
    state: Mutex<State>,
    registry: Mutex<CallbackRegistry>,
    auth_listener: Mutex<Option<AuthListener>>,
}

/// Handle to the connection manager. Clones share one connection.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Backend with tokens preloaded from the store. Nothing connects until
    /// [`Backend::update_credentials`].
    pub fn new(options: BackendOptions) -> Self {
        let tokens = options.token_store.load().unwrap_or_else(|e| {
            log::warn!("[Backend] Could not load stored tokens: {e}");
            Tokens::default()
        });

        let state = State {
            credentials: None,
            tokens,
            session: None,
            generation: 0,
            authed: false,
            reconnecting: false,
            phase: SessionState::Idle,
            voice_channel: None,
            user_id: None,
        };

        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(state),
                registry: Mutex::new(CallbackRegistry::new()),
                auth_listener: Mutex::new(None),
            }),
        }
    }

    /// Set the listener told about every authentication success or failure.
    pub fn set_auth_listener(&self, listener: impl Fn(AuthOutcome) + Send + Sync + 'static) {
        *lock(&self.inner.auth_listener) = Some(Arc::new(listener));
    }

    /// Store credentials and (re)build the session.
    ///
    /// Tokens passed here replace the stored ones; `None` keeps what the
    /// token store had. Connection and authentication problems are reported
    /// to the auth listener, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MissingCredentials`] (also reported to the
    /// listener) if the id or secret is empty.
    pub fn update_credentials(
        &self,
        client_id: &str,
        client_secret: &str,
        access_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Result<()> {
        let credentials = match ClientCredentials::new(client_id, client_secret) {
            Ok(credentials) => credentials,
            Err(e) => {
                log::warn!("[Backend] Rejected credentials: {e}");
                self.inner.report_auth(Err(e.to_string()));
                return Err(e);
            }
        };

        {
            let mut state = lock(&self.inner.state);
            state.credentials = Some(credentials);
            let supplied = Tokens::new(access_token, refresh_token);
            if !supplied.is_empty() {
                state.tokens = supplied;
            }
        }

        self.inner.setup_client();
        Ok(())
    }

    /// Register `callback` for events or replies under `key`.
    ///
    /// Registering the same `Arc` twice for a key returns the first handle.
    /// The first callback for a subscribable key subscribes immediately when
    /// authenticated, otherwise after the next `AUTHENTICATE`.
    pub fn register_callback(&self, key: &str, callback: EventCallback) -> CallbackHandle {
        let (handle, subscribe_on) = {
            let mut registry = lock(&self.inner.registry);
            let (handle, newly_keyed) = registry.register(key, callback);
            let state = lock(&self.inner.state);
            let session = if newly_keyed && state.authed && is_subscribable(key) {
                state.session.clone()
            } else {
                None
            };
            (handle, session)
        };

        if let Some(session) = subscribe_on {
            if let Err(e) = session.subscribe(key, None) {
                log::warn!("[Backend] Failed to subscribe to {key}: {e}");
            }
        }
        handle
    }

    /// Remove a registration; unsubscribes once a key has no callbacks left.
    ///
    /// Returns false if the handle was not registered.
    pub fn unregister_callback(&self, handle: &CallbackHandle) -> bool {
        let key = handle.key();
        let (removed, unsubscribe_on) = {
            let mut registry = lock(&self.inner.registry);
            let removed = registry.unregister(handle);
            let emptied = removed && !registry.contains(key);
            let state = lock(&self.inner.state);
            let session = if emptied && state.authed && is_subscribable(key) {
                state.session.clone()
            } else {
                None
            };
            (removed, session)
        };

        if let Some(session) = unsubscribe_on {
            if let Err(e) = session.unsubscribe(key, None) {
                log::warn!("[Backend] Failed to unsubscribe from {key}: {e}");
            }
        }
        removed
    }

    /// Mute or unmute the microphone.
    pub fn set_mute(&self, mute: bool) -> Result<()> {
        self.with_session(|s| s.set_voice_settings(json!({"mute": mute})))
    }

    /// Deafen or undeafen.
    pub fn set_deafen(&self, deaf: bool) -> Result<()> {
        self.with_session(|s| s.set_voice_settings(json!({"deaf": deaf})))
    }

    /// Switch input mode.
    pub fn set_push_to_talk(&self, mode: VoiceMode) -> Result<()> {
        self.with_session(|s| s.set_voice_settings(json!({"mode": {"type": mode.as_str()}})))
    }

    /// Join a voice channel, or leave voice with `None`.
    pub fn change_voice_channel(&self, channel_id: Option<&str>) -> Result<()> {
        self.with_session(|s| s.select_voice_channel(channel_id, true))
    }

    /// Focus a text channel.
    pub fn change_text_channel(&self, channel_id: &str) -> Result<()> {
        self.with_session(|s| s.select_text_channel(channel_id))
    }

    /// Set another user's local volume, clamped to `0..=200`.
    pub fn set_user_volume(&self, user_id: &str, volume: u16) -> Result<()> {
        let volume = volume.min(MAX_USER_VOLUME);
        self.with_session(|s| s.set_user_voice_settings(user_id, volume))
    }

    /// Subscribe to voice-state create/update/delete for one channel.
    pub fn subscribe_voice_states(&self, channel_id: &str) -> Result<()> {
        self.with_session(|s| {
            VOICE_STATE_EVENTS
                .iter()
                .try_for_each(|event| s.subscribe(event, Some(json!({"channel_id": channel_id}))))
        })
    }

    /// Undo [`Backend::subscribe_voice_states`].
    pub fn unsubscribe_voice_states(&self, channel_id: &str) -> Result<()> {
        self.with_session(|s| {
            VOICE_STATE_EVENTS
                .iter()
                .try_for_each(|event| s.unsubscribe(event, Some(json!({"channel_id": channel_id}))))
        })
    }

    /// Request a channel; the reply goes to `GET_CHANNEL` callbacks.
    pub fn get_channel(&self, channel_id: &str) -> Result<()> {
        self.with_session(|s| s.get_channel(channel_id))
    }

    /// Request the current voice channel; the reply goes to
    /// `VOICE_CHANNEL_SELECT` callbacks.
    pub fn request_current_voice_channel(&self) -> Result<()> {
        self.with_session(Session::get_selected_voice_channel)
    }

    /// Request voice settings; the reply goes to `VOICE_SETTINGS_UPDATE`
    /// callbacks.
    pub fn get_voice_settings(&self) -> Result<()> {
        self.with_session(Session::get_voice_settings)
    }

    /// Run `command` against the live session.
    ///
    /// Without one, schedules a reconnect and returns
    /// [`RpcError::NotReady`] instead of blocking.
    fn with_session(&self, command: impl FnOnce(&Session) -> Result<()>) -> Result<()> {
        let session = lock(&self.inner.state)
            .session
            .clone()
            .filter(|s| s.is_connected());

        match session {
            Some(session) => command(&session),
            None => {
                log::info!("[Backend] Not connected, scheduling reconnect");
                self.inner.spawn_setup();
                Err(RpcError::NotReady)
            }
        }
    }

    /// Whether authenticated over a live session.
    pub fn is_authed(&self) -> bool {
        let state = lock(&self.inner.state);
        state.authed && state.session.as_ref().is_some_and(|s| s.is_connected())
    }

    /// Whether a session is connected (authenticated or not).
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state)
            .session
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> SessionState {
        let state = lock(&self.inner.state);
        let live = state.session.as_ref().is_some_and(|s| s.is_connected());
        match state.phase {
            SessionState::Idle | SessionState::Connecting => state.phase,
            _ if !live => SessionState::Idle,
            phase => phase,
        }
    }

    /// Last known voice channel id.
    pub fn current_voice_channel(&self) -> Option<String> {
        lock(&self.inner.state).voice_channel.clone()
    }

    /// Id of the logged-in user.
    pub fn current_user_id(&self) -> Option<String> {
        lock(&self.inner.state).user_id.clone()
    }

    /// Disconnect and forget authentication. Callbacks stay registered.
    pub fn close(&self) {
        let session = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.authed = false;
            state.phase = SessionState::Idle;
            state.session.take()
        };
        if let Some(session) = session {
            session.disconnect();
            log::info!("[Backend] Closed");
        }
    }
}

impl Inner {
    fn report_auth(&self, outcome: AuthOutcome) {
        let listener = lock(&self.auth_listener).clone();
        if let Some(listener) = listener {
            listener(outcome);
        }
    }

    /// Build a new session unless a reconnect is already running.
    fn setup_client(self: &Arc<Self>) {
        if self.claim_reconnect() {
            self.run_setup();
        }
    }

    /// Like [`Inner::setup_client`] but on a background thread.
    fn spawn_setup(self: &Arc<Self>) {
        if lock(&self.state).credentials.is_none() {
            log::debug!("[Backend] No credentials yet, not reconnecting");
            return;
        }
        if !self.claim_reconnect() {
            return;
        }

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("discord-rpc-reconnect".to_string())
            .spawn(move || inner.run_setup());
        if let Err(e) = spawned {
            log::error!("[Backend] Failed to spawn reconnect thread: {e}");
            lock(&self.state).reconnecting = false;
        }
    }

    fn claim_reconnect(&self) -> bool {
        let mut state = lock(&self.state);
        if state.reconnecting {
            log::info!("[Backend] Reconnect already in progress");
            return false;
        }
        state.reconnecting = true;
        true
    }

    /// Caller must hold the reconnect guard.
    ///
    /// The guard covers connecting and installing the session only, so a
    /// reply to the first `AUTHENTICATE`/`AUTHORIZE` can already schedule the
    /// next reconnect.
    fn run_setup(self: &Arc<Self>) {
        let connected = {
            let _guard = scopeguard::guard((), |()| {
                lock(&self.state).reconnecting = false;
            });
            self.connect_session()
        };

        let result = match connected {
            Ok(Some((session, generation, access_token))) => {
                let phase = if access_token.is_some() {
                    SessionState::Authenticating
                } else {
                    SessionState::Authorizing
                };
                self.set_phase(generation, phase);
                session
                    .authenticate(access_token.as_deref())
                    .inspect_err(|_| self.teardown(generation))
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            log::error!("[Backend] Session setup failed: {e}");
            self.report_auth(Err(e.to_string()));
        }
    }

    /// Replace the current session with a freshly handshaken one.
    ///
    /// Returns the new session, its generation, and the access token to
    /// authenticate with, or `None` if [`Backend::close`] raced the setup.
    fn connect_session(self: &Arc<Self>) -> Result<Option<(Arc<Session>, u64, Option<String>)>> {
        let (credentials, access_token, previous, generation) = {
            let mut state = lock(&self.state);
            let credentials = state
                .credentials
                .clone()
                .ok_or(RpcError::MissingCredentials)?;
            state.generation += 1;
            state.authed = false;
            state.phase = SessionState::Connecting;
            (
                credentials,
                state.tokens.access_token.clone(),
                state.session.take(),
                state.generation,
            )
        };

        if let Some(previous) = previous {
            previous.disconnect();
        }

        log::info!("[Backend] Connecting to Discord");
        let session = Arc::new(Session::new(
            credentials,
            Arc::clone(&self.options.oauth),
            self.options.session.clone(),
        ));

        let weak: Weak<Self> = Arc::downgrade(self);
        let sink: EventSink = Arc::new(move |incoming: Incoming| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_incoming(generation, incoming);
            }
        });

        if let Err(e) = session.connect(sink) {
            self.set_phase(generation, SessionState::Idle);
            return Err(e);
        }

        let mut state = lock(&self.state);
        if state.generation != generation {
            drop(state);
            log::debug!("[Backend] Session superseded during setup");
            session.disconnect();
            return Ok(None);
        }
        state.session = Some(Arc::clone(&session));
        if let Some(user_id) = session.user_id() {
            state.user_id = Some(user_id);
        }
        state.phase = SessionState::HandshakeReady;
        drop(state);

        Ok(Some((session, generation, access_token)))
    }

    fn set_phase(&self, generation: u64, phase: SessionState) {
        let mut state = lock(&self.state);
        if state.generation == generation {
            state.phase = phase;
        }
    }

    /// Drop the session of `generation`, if it is still current.
    fn teardown(&self, generation: u64) {
        let session = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            state.authed = false;
            state.phase = SessionState::Idle;
            state.session.take()
        };
        if let Some(session) = session {
            session.disconnect();
        }
    }

    fn current_session(&self, generation: u64) -> Option<Arc<Session>> {
        let state = lock(&self.state);
        if state.generation == generation {
            state.session.clone()
        } else {
            None
        }
    }

    /// Persist a new token pair with a single save.
    fn store_tokens(&self, tokens: Tokens) {
        lock(&self.state).tokens = tokens.clone();
        if let Err(e) = self.options.token_store.save(&tokens) {
            log::warn!("[Backend] Failed to persist tokens: {e}");
        }
    }

    fn handle_incoming(self: &Arc<Self>, generation: u64, incoming: Incoming) {
        let Incoming::Frame { opcode, payload } = incoming else {
            return;
        };

        if opcode == Opcode::Close {
            log::warn!("[Backend] Discord is closing the connection: {payload}");
            return;
        }

        let msg = match Message::parse(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("[Backend] Dropping undecodable message: {e}");
                return;
            }
        };

        let Some(session) = self.current_session(generation) else {
            log::debug!("[Backend] Ignoring message from a replaced session");
            return;
        };

        let answered = msg.nonce.as_deref().and_then(|n| session.resolve_reply(n));
        let cmd_name = msg.cmd.as_deref().unwrap_or_default();
        if answered.is_none() && cmd_name != cmd::DISPATCH {
            log::debug!("[Backend] Reply to {cmd_name} matches no pending command");
        }

        if let Some(code) = msg.error_code().filter(|c| is_session_expired(*c)) {
            self.recover_expired_session(&session, generation, code);
            return;
        }

        if msg.is_error() {
            self.on_error_reply(cmd_name, &msg);
            return;
        }

        match cmd_name {
            cmd::AUTHORIZE => self.on_authorize(&session, generation, &msg),
            cmd::AUTHENTICATE => self.on_authenticated(&session, generation, &msg),
            cmd::DISPATCH => self.on_dispatch(&msg),
            cmd::GET_SELECTED_VOICE_CHANNEL => {
                self.cache_voice_channel(&msg.data);
                self.dispatch(evt::VOICE_CHANNEL_SELECT, &msg.data);
            }
            cmd::GET_VOICE_SETTINGS => self.dispatch(evt::VOICE_SETTINGS_UPDATE, &msg.data),
            cmd::GET_CHANNEL => self.dispatch(cmd::GET_CHANNEL, &msg.data),
            other => log::debug!("[Backend] {other} acknowledged"),
        }
    }

    /// Handle codes 4006/4009 without surfacing them.
    fn recover_expired_session(self: &Arc<Self>, session: &Session, generation: u64, code: i64) {
        log::info!("[Backend] {}, recovering", RpcError::SessionExpired(code));

        let refresh_token = lock(&self.state).tokens.refresh_token.clone();
        let Some(refresh_token) = refresh_token else {
            // The rejected access token must not be offered again.
            log::info!("[Backend] No refresh token, re-authorizing");
            self.store_tokens(Tokens::default());
            self.spawn_setup();
            return;
        };

        match session.refresh(&refresh_token) {
            Ok(pair) => {
                log::info!("[OAuth] Access token refreshed");
                let refresh = pair.refresh_token.clone().or(Some(refresh_token));
                self.store_tokens(Tokens::new(Some(pair.access_token.clone()), refresh));
                self.set_phase(generation, SessionState::Authenticating);
                if let Err(e) = session.authenticate(Some(&pair.access_token)) {
                    log::warn!("[Backend] Re-authentication failed to send: {e}");
                    self.spawn_setup();
                }
            }
            Err(e) => {
                log::warn!("[OAuth] Token refresh failed, re-authorizing: {e}");
                self.store_tokens(Tokens::default());
                self.spawn_setup();
            }
        }
    }

    fn on_error_reply(&self, cmd_name: &str, msg: &Message) {
        let reason = format!(
            "{cmd_name} failed (code {}): {}",
            msg.error_code().map_or_else(|| "none".to_string(), |c| c.to_string()),
            msg.error_message().unwrap_or("no message")
        );
        log::warn!("[Backend] {reason}");

        if matches!(cmd_name, cmd::AUTHORIZE | cmd::AUTHENTICATE) {
            self.report_auth(Err(reason));
        }
    }

    fn on_authorize(&self, session: &Session, generation: u64, msg: &Message) {
        let Some(code) = msg.data.get("code").and_then(Value::as_str) else {
            log::error!("[Backend] AUTHORIZE reply carried no code");
            self.report_auth(Err("authorization returned no code".to_string()));
            return;
        };

        match session.get_access_token(code) {
            Ok(pair) => {
                log::info!("[OAuth] Authorization code exchanged");
                self.store_tokens(Tokens::new(
                    Some(pair.access_token.clone()),
                    pair.refresh_token.clone(),
                ));
                self.set_phase(generation, SessionState::Authenticating);
                if let Err(e) = session.authenticate(Some(&pair.access_token)) {
                    log::error!("[Backend] Failed to send AUTHENTICATE: {e}");
                    self.report_auth(Err(e.to_string()));
                }
            }
            Err(e) => {
                log::error!("[OAuth] Code exchange failed: {e}");
                self.report_auth(Err(e.to_string()));
                self.teardown(generation);
            }
        }
    }

    fn on_authenticated(&self, session: &Session, generation: u64, msg: &Message) {
        let keys = {
            let registry = lock(&self.registry);
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            state.authed = true;
            state.phase = SessionState::Authenticated;
            if let Some(user_id) = msg.user_id() {
                state.user_id = Some(user_id.to_string());
            }
            registry.keys()
        };

        log::info!("[Backend] Authenticated");
        self.report_auth(Ok(()));

        for key in keys.iter().filter(|k| is_subscribable(k)) {
            if let Err(e) = session.subscribe(key, None) {
                log::warn!("[Backend] Failed to subscribe to {key}: {e}");
            }
        }
        if let Err(e) = session.get_selected_voice_channel() {
            log::warn!("[Backend] Failed to request current voice channel: {e}");
        }
    }

    fn on_dispatch(&self, msg: &Message) {
        let Some(event) = msg.evt.as_deref() else {
            log::debug!("[Backend] DISPATCH without evt");
            return;
        };
        if event == evt::VOICE_CHANNEL_SELECT {
            self.cache_voice_channel(&msg.data);
        }
        self.dispatch(event, &msg.data);
    }

    fn cache_voice_channel(&self, data: &Value) {
        let channel = data
            .get("channel_id")
            .or_else(|| data.get("id"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        lock(&self.state).voice_channel = channel;
    }

    /// Invoke the callbacks for `key` in registration order, outside all locks.
    fn dispatch(&self, key: &str, data: &Value) {
        let callbacks = lock(&self.registry).callbacks(key);
        if callbacks.is_empty() {
            log::debug!("[Backend] No callbacks for {key}");
            return;
        }
        for callback in callbacks {
            callback(data);
        }
    }
}
