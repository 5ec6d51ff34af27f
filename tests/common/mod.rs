//! Shared fixtures: a scripted Discord IPC peer and a counting token exchange.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tempfile::TempDir;
use voicedeck::ipc::framing::{self, Header, HEADER_LEN};
use voicedeck::ipc::Opcode;
use voicedeck::rpc::oauth::{ClientCredentials, TokenExchange, TokenPair};
use voicedeck::rpc::SessionOptions;
use voicedeck::{Backend, BackendOptions, MemoryTokenStore, Result, RpcError};

/// How the fake Discord answers.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Access tokens answered with a 4009 error.
    pub rejected_tokens: Vec<String>,
    /// Answer `AUTHORIZE` with an access-denied error.
    pub deny_authorize: bool,
    /// Answer the handshake with code 4000.
    pub reject_client_id: bool,
}

type Writer = Arc<Mutex<UnixStream>>;

/// A Discord client stand-in listening on `<dir>/discord-ipc-0`.
///
/// Records every frame it receives as `(opcode, json)`.
pub struct FakeDiscord {
    dir: TempDir,
    frames: Arc<Mutex<Vec<(i32, Value)>>>,
    current: Arc<Mutex<Option<Writer>>>,
}

impl FakeDiscord {
    pub fn start() -> Self {
        Self::with_script(Script::default())
    }

    pub fn with_script(script: Script) -> Self {
        let dir = TempDir::new().unwrap();
        let listener = UnixListener::bind(dir.path().join("discord-ipc-0")).unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let current: Arc<Mutex<Option<Writer>>> = Arc::new(Mutex::new(None));

        {
            let frames = Arc::clone(&frames);
            let current = Arc::clone(&current);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let writer = Arc::new(Mutex::new(stream.try_clone().unwrap()));
                    *current.lock().unwrap() = Some(Arc::clone(&writer));

                    let frames = Arc::clone(&frames);
                    let script = script.clone();
                    thread::spawn(move || serve(stream, &writer, &frames, &script));
                }
            });
        }

        Self {
            dir,
            frames,
            current,
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Every frame received so far.
    pub fn frames(&self) -> Vec<(i32, Value)> {
        self.frames.lock().unwrap().clone()
    }

    /// Command envelopes named `cmd`, in arrival order.
    pub fn commands(&self, cmd: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|(op, v)| *op == Opcode::Frame.raw() && v["cmd"] == cmd)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn handshakes(&self) -> usize {
        self.frames()
            .iter()
            .filter(|(op, _)| *op == Opcode::Handshake.raw())
            .count()
    }

    /// Send a frame on the live connection.
    pub fn push(&self, value: &Value) {
        self.push_raw(Opcode::Frame, &serde_json::to_vec(value).unwrap());
    }

    pub fn push_raw(&self, opcode: Opcode, payload: &[u8]) {
        let writer = self.current.lock().unwrap().clone().expect("no client connected");
        write_raw(&writer, opcode, payload);
    }

    /// Close the live connection from the Discord side.
    pub fn drop_connection(&self) {
        if let Some(writer) = self.current.lock().unwrap().take() {
            let _ = writer.lock().unwrap().shutdown(Shutdown::Both);
        }
    }
}

fn write_raw(writer: &Writer, opcode: Opcode, payload: &[u8]) {
    let frame = framing::encode_raw(opcode, payload).unwrap();
    let _ = writer.lock().unwrap().write_all(&frame);
}

fn reply(writer: &Writer, opcode: Opcode, value: &Value) {
    write_raw(writer, opcode, &serde_json::to_vec(value).unwrap());
}

fn read_frame(stream: &mut UnixStream) -> Option<(i32, Value)> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).ok()?;
    let header = Header::parse(header);
    let mut payload = vec![0u8; header.payload_len().ok()?];
    stream.read_exact(&mut payload).ok()?;
    Some((header.opcode, serde_json::from_slice(&payload).ok()?))
}

fn serve(
    mut stream: UnixStream,
    writer: &Writer,
    frames: &Mutex<Vec<(i32, Value)>>,
    script: &Script,
) {
    while let Some((opcode, value)) = read_frame(&mut stream) {
        frames.lock().unwrap().push((opcode, value.clone()));

        if opcode == Opcode::Handshake.raw() {
            if script.reject_client_id {
                reply(writer, Opcode::Close, &json!({"code": 4000, "message": "Invalid Client ID"}));
            } else {
                reply(
                    writer,
                    Opcode::Frame,
                    &json!({
                        "cmd": "DISPATCH",
                        "evt": "READY",
                        "data": {"v": 1, "user": {"id": "42", "username": "tester"}}
                    }),
                );
            }
            continue;
        }

        let cmd = value["cmd"].as_str().unwrap_or_default().to_string();
        let nonce = value["nonce"].clone();
        let answer = match cmd.as_str() {
            "AUTHORIZE" if script.deny_authorize => json!({
                "cmd": "AUTHORIZE", "evt": "ERROR", "nonce": nonce,
                "data": {"code": 5000, "message": "OAuth2 Error: access_denied"}
            }),
            "AUTHORIZE" => json!({"cmd": "AUTHORIZE", "nonce": nonce, "data": {"code": "abc"}}),
            "AUTHENTICATE" => {
                let token = value["args"]["access_token"].as_str().unwrap_or_default();
                if script.rejected_tokens.iter().any(|t| t == token) {
                    json!({
                        "cmd": "AUTHENTICATE", "evt": "ERROR", "nonce": nonce,
                        "data": {"code": 4009, "message": "Invalid access token"}
                    })
                } else {
                    json!({
                        "cmd": "AUTHENTICATE", "nonce": nonce,
                        "data": {"user": {"id": "42"}, "access_token": token}
                    })
                }
            }
            "GET_SELECTED_VOICE_CHANNEL" => {
                json!({"cmd": "GET_SELECTED_VOICE_CHANNEL", "nonce": nonce, "data": null})
            }
            "SUBSCRIBE" | "UNSUBSCRIBE" => {
                json!({"cmd": cmd, "nonce": nonce, "data": {"evt": value["evt"]}})
            }
            _ => json!({"cmd": cmd, "nonce": nonce, "data": {}}),
        };
        reply(writer, Opcode::Frame, &answer);
    }
}

/// Token exchange that records its calls.
#[derive(Debug, Default)]
pub struct FakeExchange {
    pub codes: Mutex<Vec<String>>,
    pub refreshes: Mutex<Vec<String>>,
    pub fail_refresh: bool,
}

impl FakeExchange {
    pub fn failing_refresh() -> Self {
        Self {
            fail_refresh: true,
            ..Self::default()
        }
    }

    pub fn codes(&self) -> Vec<String> {
        self.codes.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> Vec<String> {
        self.refreshes.lock().unwrap().clone()
    }
}

impl TokenExchange for FakeExchange {
    fn exchange_code(&self, _client: &ClientCredentials, code: &str) -> Result<TokenPair> {
        self.codes.lock().unwrap().push(code.to_string());
        Ok(TokenPair {
            access_token: "tok1".into(),
            refresh_token: Some("ref1".into()),
        })
    }

    fn refresh(&self, _client: &ClientCredentials, refresh_token: &str) -> Result<TokenPair> {
        self.refreshes.lock().unwrap().push(refresh_token.to_string());
        if self.fail_refresh {
            return Err(RpcError::OAuthExchangeFailed("invalid_grant".into()));
        }
        Ok(TokenPair {
            access_token: "tok2".into(),
            refresh_token: Some("ref2".into()),
        })
    }
}

/// Short handshake budget so failure cases finish quickly.
pub fn fast_session(dir: &std::path::Path) -> SessionOptions {
    SessionOptions {
        ipc_dir: Some(dir.to_path_buf()),
        handshake_attempts: 2,
        handshake_timeout: Duration::from_millis(500),
        handshake_retry_delay: Duration::from_millis(20),
    }
}

pub fn backend_for(
    dir: &std::path::Path,
    store: &Arc<MemoryTokenStore>,
    exchange: &Arc<FakeExchange>,
) -> Backend {
    let options = BackendOptions::new(Arc::clone(store) as _, Arc::clone(exchange) as _)
        .with_session_options(fast_session(dir));
    Backend::new(options)
}

/// Poll `condition` for up to five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Give in-flight frames time to arrive before asserting on absence.
pub fn settle() {
    thread::sleep(Duration::from_millis(300));
}
