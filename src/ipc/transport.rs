//! Framed byte exchange over the Discord IPC Unix socket.
//!
//! [`Transport`] owns a single [`UnixStream`]. It discovers the socket by
//! probing `<base>/discord-ipc-0` through `-9`, writes whole frames, and reads
//! frames with a bounded timeout so a polling loop never blocks forever.
//!
//! Reads and writes may happen from different threads through
//! [`Transport::try_clone`]: the poller owns a read clone while callers write
//! through the original. Stream sockets keep separate read and write buffers,
//! so a write during a blocked read is fine.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::framing::{self, Header, Opcode, HEADER_LEN};
use crate::constants::{
    FRAME_COMPLETION_DEADLINE, IPC_BASE_DIR_VARS, IPC_FALLBACK_DIR, IPC_SOCKET_CANDIDATES,
    IPC_SOCKET_PREFIX, SOCKET_RECEIVE_TIMEOUT, SOCKET_WRITE_TIMEOUT,
};
use crate::error::{Result, RpcError};

/// Outcome of a single [`Transport::receive`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Nothing arrived within the timeout. Normal for an idle poller.
    Idle,
    /// The peer closed the connection.
    Disconnected,
    /// A complete frame.
    Frame {
        /// Frame opcode.
        opcode: Opcode,
        /// UTF-8 payload, not yet JSON-decoded.
        payload: String,
    },
}

/// Resolve the socket base directory from an environment lookup.
///
/// The first non-empty variable of [`IPC_BASE_DIR_VARS`] wins, falling back to
/// [`IPC_FALLBACK_DIR`]. One trailing `/` is stripped.
pub fn resolve_base_dir(lookup: impl Fn(&str) -> Option<String>) -> String {
    let base = IPC_BASE_DIR_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| IPC_FALLBACK_DIR.to_string());
    match base.strip_suffix('/') {
        Some(stripped) => stripped.to_string(),
        None => base,
    }
}

/// Candidate socket paths under `base`, in probe order.
pub fn candidate_paths(base: &str) -> Vec<PathBuf> {
    (0..IPC_SOCKET_CANDIDATES)
        .map(|i| PathBuf::from(format!("{base}/{IPC_SOCKET_PREFIX}{i}")))
        .collect()
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Connection to the Discord IPC socket.
#[derive(Debug, Default)]
pub struct Transport {
    /// Explicit base directory; `None` means resolve from the environment.
    base_dir: Option<PathBuf>,
    stream: Option<UnixStream>,
    connected_path: Option<PathBuf>,
}

impl Transport {
    /// Transport that discovers its base directory from the environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that probes sockets under `dir` instead of the environment chain.
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Base directory that [`Transport::connect`] will probe.
    pub fn base_dir(&self) -> String {
        match &self.base_dir {
            Some(dir) => {
                let dir = dir.to_string_lossy();
                dir.strip_suffix('/').unwrap_or(&dir).to_string()
            }
            None => resolve_base_dir(|var| std::env::var(var).ok()),
        }
    }

    /// Path of the socket currently connected, if any.
    pub fn connected_path(&self) -> Option<&Path> {
        self.connected_path.as_deref()
    }

    /// Whether a socket is currently held.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to the first live IPC socket.
    ///
    /// Any previously held socket is closed first. Missing candidates are
    /// skipped quietly; other failures (stale socket files) are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::TransportUnavailable`] once all candidates fail.
    pub fn connect(&mut self) -> Result<()> {
        self.disconnect();

        for path in candidate_paths(&self.base_dir()) {
            match UnixStream::connect(&path) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(SOCKET_RECEIVE_TIMEOUT))?;
                    stream.set_write_timeout(Some(SOCKET_WRITE_TIMEOUT))?;
                    log::debug!("[Transport] Connected to {}", path.display());
                    self.stream = Some(stream);
                    self.connected_path = Some(path);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::debug!("[Transport] No socket at {}", path.display());
                }
                Err(e) => {
                    log::warn!("[Transport] Skipping {}: {e}", path.display());
                }
            }
        }

        Err(RpcError::TransportUnavailable)
    }

    fn stream(&mut self) -> Result<&mut UnixStream> {
        self.stream.as_mut().ok_or_else(|| {
            RpcError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "IPC socket is not connected",
            ))
        })
    }

    /// Encode `payload` as JSON and write it as one frame.
    ///
    /// Partial writes are retried until the whole frame is flushed.
    pub fn send(&mut self, payload: &Value, opcode: Opcode) -> Result<()> {
        let frame = framing::encode_json(opcode, payload)?;
        self.write_frame(&frame)
    }

    /// Write an already-serialized payload as one frame.
    pub fn send_raw(&mut self, payload: &[u8], opcode: Opcode) -> Result<()> {
        let frame = framing::encode_raw(opcode, payload)?;
        self.write_frame(&frame)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(frame)?;
        stream.flush()?;
        Ok(())
    }

    /// Receive one frame, waiting at most [`SOCKET_RECEIVE_TIMEOUT`].
    pub fn receive(&mut self) -> Result<Received> {
        self.receive_within(SOCKET_RECEIVE_TIMEOUT)
    }

    /// Receive one frame, waiting at most `timeout` for it to start.
    ///
    /// Once the first header byte arrives the rest of the frame is read to
    /// completion (bounded by [`FRAME_COMPLETION_DEADLINE`]); fragments are
    /// never handed upward.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] for a malformed frame. A complete frame
    /// with an unknown opcode or non-UTF-8 payload is dropped and the socket
    /// stays usable. A bad declared length or a frame that stalls past the
    /// deadline leaves the stream out of sync, so the socket is closed as well
    /// (see [`Transport::is_open`]). I/O failures are returned as
    /// [`RpcError::Io`].
    pub fn receive_within(&mut self, timeout: Duration) -> Result<Received> {
        let stream = self.stream()?;
        stream.set_read_timeout(Some(timeout))?;

        let mut header = [0u8; HEADER_LEN];
        let mut started = None;
        match fill(stream, &mut header, &mut started) {
            Ok(Fill::Complete) => {}
            Ok(Fill::Idle) => return Ok(Received::Idle),
            Ok(Fill::Eof) => return Ok(Received::Disconnected),
            Err(e) => return Err(self.lose_sync(e)),
        }

        let header = Header::parse(header);
        let length = match header.payload_len() {
            Ok(length) => length,
            Err(e) => return Err(self.lose_sync(e)),
        };

        let mut payload = vec![0u8; length];
        match fill(self.stream()?, &mut payload, &mut started) {
            Ok(Fill::Complete) => {}
            Ok(_) => return Ok(Received::Disconnected),
            Err(e) => return Err(self.lose_sync(e)),
        }

        let opcode = header.opcode()?;
        let payload = String::from_utf8(payload)
            .map_err(|e| RpcError::protocol(format!("payload is not UTF-8: {e}")))?;
        Ok(Received::Frame { opcode, payload })
    }

    /// Close a socket whose frame boundaries can no longer be trusted.
    fn lose_sync(&mut self, e: RpcError) -> RpcError {
        if matches!(e, RpcError::Protocol(_)) {
            log::warn!("[Transport] Frame stream out of sync, closing socket: {e}");
            self.disconnect();
        }
        e
    }

    /// Shut down and drop the socket.
    ///
    /// Errors from an already-closed peer are ignored. A later
    /// [`Transport::connect`] opens a fresh socket.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::debug!("[Transport] Shutdown on closed socket: {e}");
            }
            log::debug!("[Transport] Disconnected");
        }
        self.connected_path = None;
    }

    /// Second handle on the same socket, for a dedicated reader thread.
    pub fn try_clone(&self) -> Result<Self> {
        let stream = self.stream.as_ref().ok_or_else(|| {
            RpcError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "IPC socket is not connected",
            ))
        })?;
        Ok(Self {
            base_dir: self.base_dir.clone(),
            stream: Some(stream.try_clone()?),
            connected_path: self.connected_path.clone(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Fill {
    Complete,
    /// Timed out before the first byte of the frame.
    Idle,
    Eof,
}

/// Read until `buf` is full.
///
/// `started` records when the first byte of the frame was seen; once set,
/// timeouts no longer mean idle and completion is bounded by
/// [`FRAME_COMPLETION_DEADLINE`].
fn fill(stream: &mut UnixStream, buf: &mut [u8], started: &mut Option<Instant>) -> Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Fill::Eof),
            Ok(n) => {
                started.get_or_insert_with(Instant::now);
                filled += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) => match started {
                None => return Ok(Fill::Idle),
                Some(at) if at.elapsed() >= FRAME_COMPLETION_DEADLINE => {
                    return Err(RpcError::protocol(format!(
                        "truncated frame: {filled} of {} bytes",
                        buf.len()
                    )));
                }
                Some(_) => {}
            },
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Fill::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    fn listen(dir: &TempDir, index: u8) -> UnixListener {
        UnixListener::bind(dir.path().join(format!("{IPC_SOCKET_PREFIX}{index}"))).unwrap()
    }

    fn connected_pair() -> (TempDir, Transport, UnixStream) {
        let dir = TempDir::new().unwrap();
        let listener = listen(&dir, 0);
        let mut transport = Transport::with_base_dir(dir.path());
        transport.connect().unwrap();
        let (peer, _) = listener.accept().unwrap();
        (dir, transport, peer)
    }

    fn read_peer_frame(peer: &mut UnixStream) -> (i32, Value) {
        let mut header = [0u8; HEADER_LEN];
        peer.read_exact(&mut header).unwrap();
        let header = Header::parse(header);
        let mut payload = vec![0u8; header.payload_len().unwrap()];
        peer.read_exact(&mut payload).unwrap();
        (header.opcode, serde_json::from_slice(&payload).unwrap())
    }

    #[test]
    fn test_base_dir_prefers_runtime_dir() {
        let env: HashMap<&str, &str> =
            HashMap::from([("XDG_RUNTIME_DIR", "/run/user/1000/"), ("TMPDIR", "/var/tmp")]);
        let base = resolve_base_dir(|k| env.get(k).map(ToString::to_string));
        assert_eq!(base, "/run/user/1000");
    }

    #[test]
    fn test_base_dir_skips_empty_and_falls_through() {
        let env: HashMap<&str, &str> = HashMap::from([("XDG_RUNTIME_DIR", ""), ("TEMP", "/t")]);
        assert_eq!(resolve_base_dir(|k| env.get(k).map(ToString::to_string)), "/t");
        assert_eq!(resolve_base_dir(|_| None), "/tmp");
    }

    #[test]
    fn test_candidates_in_ascending_order() {
        let paths = candidate_paths("/run/user/1000");
        assert_eq!(paths.len(), 10);
        assert_eq!(paths[0], PathBuf::from("/run/user/1000/discord-ipc-0"));
        assert_eq!(paths[9], PathBuf::from("/run/user/1000/discord-ipc-9"));
    }

    #[test]
    fn test_connect_picks_lowest_live_socket() {
        let dir = TempDir::new().unwrap();
        // A stale regular file refuses connections and must be skipped.
        std::fs::write(dir.path().join("discord-ipc-1"), b"stale").unwrap();
        let _five = listen(&dir, 5);
        let _two = listen(&dir, 2);

        let mut transport = Transport::with_base_dir(dir.path());
        transport.connect().unwrap();
        assert_eq!(
            transport.connected_path(),
            Some(dir.path().join("discord-ipc-2").as_path())
        );
    }

    #[test]
    fn test_connect_without_sockets_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut transport = Transport::with_base_dir(dir.path());
        assert!(matches!(transport.connect(), Err(RpcError::TransportUnavailable)));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_send_writes_header_and_json() {
        let (_dir, mut transport, mut peer) = connected_pair();
        let value = json!({"v": 1, "client_id": "123"});
        transport.send(&value, Opcode::Handshake).unwrap();

        let (opcode, received) = read_peer_frame(&mut peer);
        assert_eq!(opcode, 0);
        assert_eq!(received, value);
    }

    #[test]
    fn test_receive_idle_when_nothing_arrives() {
        let (_dir, mut transport, _peer) = connected_pair();
        let got = transport.receive_within(Duration::from_millis(20)).unwrap();
        assert_eq!(got, Received::Idle);
    }

    #[test]
    fn test_receive_reassembles_fragmented_frame() {
        let (_dir, mut transport, mut peer) = connected_pair();
        let frame = framing::encode_json(Opcode::Frame, &json!({"cmd": "DISPATCH"})).unwrap();

        let writer = thread::spawn(move || {
            let (head, tail) = frame.split_at(5);
            peer.write_all(head).unwrap();
            thread::sleep(Duration::from_millis(50));
            peer.write_all(tail).unwrap();
            peer
        });

        let got = transport.receive_within(Duration::from_secs(1)).unwrap();
        assert_eq!(
            got,
            Received::Frame {
                opcode: Opcode::Frame,
                payload: r#"{"cmd":"DISPATCH"}"#.to_string(),
            }
        );
        writer.join().unwrap();
    }

    #[test]
    fn test_receive_reports_peer_close() {
        let (_dir, mut transport, peer) = connected_pair();
        drop(peer);
        let got = transport.receive_within(Duration::from_secs(1)).unwrap();
        assert_eq!(got, Received::Disconnected);
    }

    #[test]
    fn test_receive_rejects_negative_length() {
        let (_dir, mut transport, mut peer) = connected_pair();
        let mut bad = Vec::new();
        bad.extend_from_slice(&1i32.to_le_bytes());
        bad.extend_from_slice(&(-1i32).to_le_bytes());
        peer.write_all(&bad).unwrap();

        let got = transport.receive_within(Duration::from_secs(1));
        assert!(matches!(got, Err(RpcError::Protocol(_))));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_receive_closes_on_oversized_length() {
        let (_dir, mut transport, mut peer) = connected_pair();
        let mut bad = Vec::new();
        bad.extend_from_slice(&1i32.to_le_bytes());
        bad.extend_from_slice(&i32::MAX.to_le_bytes());
        bad.extend_from_slice(br#"{"cmd":"DISPATCH"}"#);
        peer.write_all(&bad).unwrap();

        let got = transport.receive_within(Duration::from_secs(1));
        assert!(matches!(got, Err(RpcError::Protocol(_))));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_non_utf8_frame_keeps_stream_in_sync() {
        let (_dir, mut transport, mut peer) = connected_pair();
        peer.write_all(&framing::encode_raw(Opcode::Frame, &[0xff, 0xfe]).unwrap())
            .unwrap();
        peer.write_all(&framing::encode_json(Opcode::Frame, &json!({"n": 1})).unwrap())
            .unwrap();

        let first = transport.receive_within(Duration::from_secs(1));
        assert!(matches!(first, Err(RpcError::Protocol(_))));
        assert!(transport.is_open());

        let second = transport.receive_within(Duration::from_secs(1)).unwrap();
        assert_eq!(
            second,
            Received::Frame {
                opcode: Opcode::Frame,
                payload: r#"{"n":1}"#.to_string(),
            }
        );
    }

    #[test]
    fn test_disconnect_then_reconnect_uses_fresh_socket() {
        let dir = TempDir::new().unwrap();
        let listener = listen(&dir, 0);
        let mut transport = Transport::with_base_dir(dir.path());

        transport.connect().unwrap();
        let (first, _) = listener.accept().unwrap();
        transport.disconnect();
        assert!(!transport.is_open());
        transport.disconnect();

        transport.connect().unwrap();
        let (mut second, _) = listener.accept().unwrap();
        transport.send(&json!({"n": 2}), Opcode::Frame).unwrap();
        let (_, value) = read_peer_frame(&mut second);
        assert_eq!(value, json!({"n": 2}));
        drop(first);
    }

    #[test]
    fn test_send_without_connection_fails() {
        let mut transport = Transport::new();
        assert!(matches!(
            transport.send(&json!({}), Opcode::Frame),
            Err(RpcError::Io(_))
        ));
    }
}
