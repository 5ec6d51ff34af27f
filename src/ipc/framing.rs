//! Wire codec for the Discord IPC socket.
//!
//! Every frame is a fixed 8-byte little-endian header followed by the payload:
//!
//! ```text
//! [i32 LE opcode] [i32 LE length] [payload: length bytes of UTF-8 JSON]
//! ```
//!
//! Opcodes:
//! - `0`: handshake (`{v, client_id}` outbound, `READY` dispatch inbound)
//! - `1`: frame (command envelopes and replies)
//! - `2`: close (peer is dropping the connection, payload carries a code)
//! - `3`: ping
//! - `4`: pong

use serde_json::Value;

use crate::constants::MAX_FRAME_PAYLOAD;
use crate::error::{Result, RpcError};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    /// Protocol handshake.
    Handshake = 0,
    /// Command or reply envelope.
    Frame = 1,
    /// Connection close notice.
    Close = 2,
    /// Keepalive request.
    Ping = 3,
    /// Keepalive response.
    Pong = 4,
}

impl Opcode {
    /// Map a raw wire value to an opcode.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Handshake),
            1 => Some(Self::Frame),
            2 => Some(Self::Close),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Raw wire value.
    pub fn raw(self) -> i32 {
        self as i32
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw opcode as read from the wire.
    pub opcode: i32,
    /// Declared payload length (may be negative on a corrupt stream).
    pub length: i32,
}

impl Header {
    /// Parse the 8 header bytes.
    pub fn parse(bytes: [u8; HEADER_LEN]) -> Self {
        let [o0, o1, o2, o3, l0, l1, l2, l3] = bytes;
        Self {
            opcode: i32::from_le_bytes([o0, o1, o2, o3]),
            length: i32::from_le_bytes([l0, l1, l2, l3]),
        }
    }

    /// Validated opcode.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] for opcodes outside `0..=4`.
    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::from_raw(self.opcode)
            .ok_or_else(|| RpcError::protocol(format!("unknown opcode {}", self.opcode)))
    }

    /// Validated payload length.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] if the length is negative or larger
    /// than [`MAX_FRAME_PAYLOAD`].
    pub fn payload_len(&self) -> Result<usize> {
        let length = usize::try_from(self.length)
            .map_err(|_| RpcError::protocol(format!("negative frame length {}", self.length)))?;
        if length > MAX_FRAME_PAYLOAD {
            return Err(RpcError::protocol(format!(
                "frame too large: {length} bytes (max {MAX_FRAME_PAYLOAD})"
            )));
        }
        Ok(length)
    }
}

/// Encode a raw frame.
///
/// # Errors
///
/// Returns [`RpcError::Protocol`] if the payload does not fit in an `i32` length.
pub fn encode_raw(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
    let length = i32::try_from(payload.len())
        .map_err(|_| RpcError::protocol(format!("payload too large: {} bytes", payload.len())))?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&opcode.raw().to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Serialize `value` to JSON and encode it as a frame.
pub fn encode_json(opcode: Opcode, value: &Value) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    encode_raw(opcode, &payload)
}
