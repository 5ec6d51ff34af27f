//! Command and event vocabulary, outbound envelopes, inbound messages.
//!
//! Only the commands voicedeck actually issues are named here, but
//! [`Command`] and [`Message`] carry any command or event generically.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Command names.
pub mod cmd {
    /// Ask the user to authorize the application; replies with an OAuth code.
    pub const AUTHORIZE: &str = "AUTHORIZE";
    /// Log in with an access token.
    pub const AUTHENTICATE: &str = "AUTHENTICATE";
    /// Pushed event (never sent by the client).
    pub const DISPATCH: &str = "DISPATCH";
    /// Start receiving an event.
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    /// Stop receiving an event.
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    /// Change mute/deaf/input mode.
    pub const SET_VOICE_SETTINGS: &str = "SET_VOICE_SETTINGS";
    /// Read the current voice settings.
    pub const GET_VOICE_SETTINGS: &str = "GET_VOICE_SETTINGS";
    /// Join (or with a null id, leave) a voice channel.
    pub const SELECT_VOICE_CHANNEL: &str = "SELECT_VOICE_CHANNEL";
    /// Focus a text channel.
    pub const SELECT_TEXT_CHANNEL: &str = "SELECT_TEXT_CHANNEL";
    /// Read the voice channel the user is in.
    pub const GET_SELECTED_VOICE_CHANNEL: &str = "GET_SELECTED_VOICE_CHANNEL";
    /// Read a channel, including its voice states.
    pub const GET_CHANNEL: &str = "GET_CHANNEL";
    /// Change the local volume/mute of another user.
    pub const SET_USER_VOICE_SETTINGS: &str = "SET_USER_VOICE_SETTINGS";
}

/// Event names.
pub mod evt {
    /// Handshake accepted.
    pub const READY: &str = "READY";
    /// A command failed; `data` has `code` and `message`.
    pub const ERROR: &str = "ERROR";
    /// The user joined or left a voice channel.
    pub const VOICE_CHANNEL_SELECT: &str = "VOICE_CHANNEL_SELECT";
    /// Mute/deaf/mode changed.
    pub const VOICE_SETTINGS_UPDATE: &str = "VOICE_SETTINGS_UPDATE";
    /// Someone joined the subscribed channel.
    pub const VOICE_STATE_CREATE: &str = "VOICE_STATE_CREATE";
    /// Someone's state changed in the subscribed channel.
    pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
    /// Someone left the subscribed channel.
    pub const VOICE_STATE_DELETE: &str = "VOICE_STATE_DELETE";
}

/// Voice-state events, which need a `channel_id` to subscribe.
pub const VOICE_STATE_EVENTS: [&str; 3] = [
    evt::VOICE_STATE_CREATE,
    evt::VOICE_STATE_UPDATE,
    evt::VOICE_STATE_DELETE,
];

/// Whether a registry key can be subscribed with a bare `SUBSCRIBE`.
///
/// Command-reply keys are delivered without a subscription, and voice-state
/// events are scoped to a channel and subscribed separately.
pub fn is_subscribable(key: &str) -> bool {
    !matches!(key, cmd::GET_CHANNEL | cmd::GET_SELECTED_VOICE_CHANNEL)
        && !VOICE_STATE_EVENTS.contains(&key)
}

/// Input mode for [`crate::Backend::set_push_to_talk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceMode {
    /// Transmit while the push-to-talk key is held.
    PushToTalk,
    /// Transmit on detected voice.
    VoiceActivity,
}

impl VoiceMode {
    /// Wire name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PushToTalk => "PUSH_TO_TALK",
            Self::VoiceActivity => "VOICE_ACTIVITY",
        }
    }

    /// Parse a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "PUSH_TO_TALK" => Some(Self::PushToTalk),
            "VOICE_ACTIVITY" => Some(Self::VoiceActivity),
            _ => None,
        }
    }
}

/// Outbound command envelope (`opcode 1`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    /// Command name.
    pub cmd: String,
    /// Fresh UUID per envelope.
    pub nonce: String,
    /// Event name, for `SUBSCRIBE`/`UNSUBSCRIBE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evt: Option<String>,
    /// Command arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Command {
    /// Command without arguments.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            nonce: Uuid::new_v4().to_string(),
            evt: None,
            args: None,
        }
    }

    /// Command with arguments.
    pub fn with_args(cmd: impl Into<String>, args: Value) -> Self {
        Self {
            args: Some(args),
            ..Self::new(cmd)
        }
    }

    /// `SUBSCRIBE`/`UNSUBSCRIBE` envelope; missing args are sent as `{}`.
    pub fn subscription(cmd: &str, event: impl Into<String>, args: Option<Value>) -> Self {
        Self {
            evt: Some(event.into()),
            args: Some(args.unwrap_or_else(|| Value::Object(serde_json::Map::new()))),
            ..Self::new(cmd)
        }
    }

    /// JSON form sent on the wire.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Inbound message: a dispatch, a command reply, or an error payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Message {
    /// Command this message answers, or `DISPATCH`.
    #[serde(default)]
    pub cmd: Option<String>,
    /// Event name for dispatches and `ERROR` replies.
    #[serde(default)]
    pub evt: Option<String>,
    /// Nonce echoed from the command envelope (absent on dispatches).
    #[serde(default)]
    pub nonce: Option<String>,
    /// Payload.
    #[serde(default)]
    pub data: Value,
    /// Top-level code, used by close/handshake rejections.
    #[serde(default)]
    pub code: Option<i64>,
    /// Top-level message accompanying `code`.
    #[serde(default)]
    pub message: Option<String>,
}

impl Message {
    /// Decode a frame payload.
    pub fn parse(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Numeric error code in `data.code`, if any.
    ///
    /// `AUTHORIZE` replies also carry `data.code`, but as a string; those are
    /// not error codes and yield `None`.
    pub fn error_code(&self) -> Option<i64> {
        self.data.get("code").and_then(Value::as_i64)
    }

    /// Error text in `data.message`, falling back to the top-level message.
    pub fn error_message(&self) -> Option<&str> {
        self.data
            .get("message")
            .and_then(Value::as_str)
            .or(self.message.as_deref())
    }

    /// Whether this is an `ERROR` reply.
    pub fn is_error(&self) -> bool {
        self.evt.as_deref() == Some(evt::ERROR)
    }

    /// Whether this is the handshake `READY` dispatch.
    pub fn is_ready(&self) -> bool {
        self.cmd.as_deref() == Some(cmd::DISPATCH) && self.evt.as_deref() == Some(evt::READY)
    }

    /// `data.user.id`, present on `READY` and `AUTHENTICATE`.
    pub fn user_id(&self) -> Option<&str> {
        self.data.pointer("/user/id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_without_args_omits_field() {
        let value = Command::new(cmd::GET_SELECTED_VOICE_CHANNEL).to_value().unwrap();
        assert_eq!(value["cmd"], "GET_SELECTED_VOICE_CHANNEL");
        assert!(value.get("args").is_none());
        assert!(value.get("evt").is_none());
        assert!(Uuid::parse_str(value["nonce"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_nonces_are_unique() {
        let a = Command::new(cmd::GET_VOICE_SETTINGS);
        let b = Command::new(cmd::GET_VOICE_SETTINGS);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_subscription_envelope() {
        let value = Command::subscription(cmd::SUBSCRIBE, evt::VOICE_SETTINGS_UPDATE, None)
            .to_value()
            .unwrap();
        assert_eq!(value["cmd"], "SUBSCRIBE");
        assert_eq!(value["evt"], "VOICE_SETTINGS_UPDATE");
        assert_eq!(value["args"], json!({}));
    }

    #[test]
    fn test_authorize_code_is_not_an_error_code() {
        let msg = Message::parse(r#"{"cmd":"AUTHORIZE","data":{"code":"abc"},"nonce":"n"}"#)
            .unwrap();
        assert_eq!(msg.error_code(), None);
        assert_eq!(msg.data["code"], "abc");
    }

    #[test]
    fn test_error_reply_fields() {
        let msg = Message::parse(
            r#"{"cmd":"AUTHENTICATE","evt":"ERROR","data":{"code":4009,"message":"Invalid token"}}"#,
        )
        .unwrap();
        assert!(msg.is_error());
        assert_eq!(msg.error_code(), Some(4009));
        assert_eq!(msg.error_message(), Some("Invalid token"));
    }

    #[test]
    fn test_ready_and_user_id() {
        let msg = Message::parse(
            r#"{"cmd":"DISPATCH","evt":"READY","data":{"v":1,"user":{"id":"42","username":"me"}}}"#,
        )
        .unwrap();
        assert!(msg.is_ready());
        assert_eq!(msg.user_id(), Some("42"));
    }

    #[test]
    fn test_null_data_is_accepted() {
        let msg = Message::parse(r#"{"cmd":"GET_SELECTED_VOICE_CHANNEL","data":null}"#).unwrap();
        assert!(msg.data.is_null());
        assert_eq!(msg.error_code(), None);
    }

    #[test]
    fn test_subscribable_keys() {
        assert!(is_subscribable(evt::VOICE_SETTINGS_UPDATE));
        assert!(is_subscribable(evt::VOICE_CHANNEL_SELECT));
        assert!(!is_subscribable(cmd::GET_CHANNEL));
        assert!(!is_subscribable(evt::VOICE_STATE_UPDATE));
    }

    #[test]
    fn test_voice_mode_wire_names() {
        assert_eq!(VoiceMode::PushToTalk.as_str(), "PUSH_TO_TALK");
        assert_eq!(VoiceMode::from_wire("VOICE_ACTIVITY"), Some(VoiceMode::VoiceActivity));
        assert_eq!(VoiceMode::from_wire("nope"), None);
    }
}
