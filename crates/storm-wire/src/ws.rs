//! RFC 6455 WebSocket frame codec.
//!
//! Implements the WebSocket wire format (RFC 6455 Section 5):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! The codec decodes masked and unmasked frames regardless of role; the
//! role only decides whether *outbound* frames are masked (client) or not
//! (server). Extensions are not negotiated, so any set RSV bit is a
//! protocol error.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// RFC 6455 close status codes used by the library.
pub mod close_status {
    /// 1000: normal closure.
    pub const NORMAL: u16 = 1000;
    /// 1001: endpoint going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// 1002: protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// 1003: unsupported data.
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// 1005: no status present (must never appear on the wire).
    pub const NO_STATUS: u16 = 1005;
    /// 1006: abnormal closure (must never appear on the wire).
    pub const ABNORMAL: u16 = 1006;
    /// 1007: invalid payload data.
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// 1008: policy violation.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// 1009: message too big.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// 1010: mandatory extension missing.
    pub const MANDATORY_EXTENSION: u16 = 1010;
    /// 1011: internal server error.
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether a close code may be written to the wire.
    ///
    /// Codes below 1000 are unassigned and 1005/1006 are reserved
    /// pseudo-codes that only exist in APIs.
    #[must_use]
    pub const fn is_sendable(code: u16) -> bool {
        code >= 1000 && code != NO_STATUS && code != ABNORMAL
    }

    /// Coerce a peer-supplied close code into one that may be echoed.
    #[must_use]
    pub const fn sanitize(code: u16) -> u16 {
        if is_sendable(code) {
            code
        } else {
            NORMAL
        }
    }
}

/// Frame opcode (low nibble of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text frame.
    Text = 0x1,
    /// Binary frame.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl Opcode {
    /// True for Close, Ping and Pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    fn from_u8(value: u8) -> Result<Self, WsProtocolError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsProtocolError::InvalidOpcode(other)),
        }
    }
}

/// A single decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the frame arrived masked (decode) or is a placeholder on
    /// encode, where masking is decided by the codec role.
    pub masked: bool,
    /// Unmasked payload bytes.
    pub payload: Bytes,
}

impl WsFrame {
    /// Build a final text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Text, payload)
    }

    /// Build a final binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Binary, payload)
    }

    /// Build a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Ping, payload)
    }

    /// Build a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Pong, payload)
    }

    /// Build a close frame carrying `[status u16 BE]` when a status is
    /// given.
    #[must_use]
    pub fn close(status: Option<u16>) -> Self {
        Self::data(Opcode::Close, encode_close_payload(status, None))
    }

    /// True for Close, Ping and Pong frames.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    fn data(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            masked: false,
            payload: payload.into(),
        }
    }
}

/// Build a close frame payload: status in big-endian followed by an
/// optional UTF-8 reason.
#[must_use]
pub fn encode_close_payload(status: Option<u16>, reason: Option<&str>) -> Bytes {
    let Some(status) = status else {
        return Bytes::new();
    };
    let reason = reason.unwrap_or("");
    let mut buf = BytesMut::with_capacity(2 + reason.len());
    buf.put_u16(status);
    buf.extend_from_slice(reason.as_bytes());
    buf.freeze()
}

/// Parse a close frame payload into `(status, reason)`.
///
/// An empty payload carries no status; a one-byte payload is malformed and
/// is treated the same way.
#[must_use]
pub fn parse_close_payload(payload: &[u8]) -> (Option<u16>, Option<String>) {
    if payload.len() < 2 {
        return (None, None);
    }
    let status = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = if payload.len() > 2 {
        String::from_utf8(payload[2..].to_vec()).ok()
    } else {
        None
    };
    (Some(status), reason)
}

/// Endpoint role; decides masking on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client frames are masked with a fresh random key per frame.
    Client,
    /// Server frames are never masked.
    Server,
}

/// WebSocket protocol violations detected by the codec.
///
/// Each variant maps onto the close status the connection should be torn
/// down with, via [`WsProtocolError::close_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsProtocolError {
    /// Opcode outside {0, 1, 2, 8, 9, 10}.
    InvalidOpcode(u8),
    /// One of RSV1-3 was set; no extension was negotiated.
    ReservedBitsSet,
    /// Control frame payload above 125 bytes.
    ControlFrameTooLarge(u64),
    /// Control frame without the FIN bit.
    FragmentedControlFrame,
    /// Frame payload above the configured maximum.
    FrameTooLarge {
        /// Declared payload length.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Frame sequence violation (for example a continuation frame with
    /// no fragmented message in progress).
    Violation(&'static str),
}

impl WsProtocolError {
    /// Close status to send before tearing the connection down.
    #[must_use]
    pub const fn close_status(&self) -> u16 {
        match self {
            Self::FrameTooLarge { .. } => close_status::MESSAGE_TOO_BIG,
            _ => close_status::PROTOCOL_ERROR,
        }
    }
}

impl fmt::Display for WsProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOpcode(op) => write!(f, "invalid opcode 0x{op:X}"),
            Self::ReservedBitsSet => write!(f, "reserved bits set without extension"),
            Self::ControlFrameTooLarge(size) => {
                write!(f, "control frame payload of {size} bytes (max 125)")
            }
            Self::FragmentedControlFrame => write!(f, "control frame without FIN"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "frame payload of {size} bytes exceeds limit of {max}")
            }
            Self::Violation(msg) => write!(f, "protocol violation: {msg}"),
        }
    }
}

impl std::error::Error for WsProtocolError {}

impl From<WsProtocolError> for std::io::Error {
    fn from(err: WsProtocolError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// Frame encoder/decoder for one direction pair of a connection.
#[derive(Debug, Clone)]
pub struct WsFrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl WsFrameCodec {
    /// Default maximum frame payload (1 MiB).
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

    /// Create a codec for the given role with the default frame cap.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_size: Self::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a server-role codec.
    #[must_use]
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Create a client-role codec.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Set the maximum accepted frame payload size.
    #[must_use]
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Endpoint role of this codec.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Try to decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; in that case `src` is left untouched. Protocol violations
    /// are returned before the full payload is buffered where possible
    /// (an oversize length fails on the header alone).
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>, WsProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let b0 = src[0];
        let b1 = src[1];

        let fin = b0 & 0x80 != 0;
        if b0 & 0x70 != 0 {
            return Err(WsProtocolError::ReservedBitsSet);
        }
        let opcode = Opcode::from_u8(b0 & 0x0F)?;

        let masked = b1 & 0x80 != 0;
        let len7 = b1 & 0x7F;

        if opcode.is_control() {
            if !fin {
                return Err(WsProtocolError::FragmentedControlFrame);
            }
            // 126/127 length markers on a control frame also exceed the
            // 125-byte cap.
            if len7 > 125 {
                return Err(WsProtocolError::ControlFrameTooLarge(u64::from(len7)));
            }
        }

        let (length_ext, payload_len) = match len7 {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (2, u64::from(u16::from_be_bytes([src[2], src[3]])))
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (8, u64::from_be_bytes(raw))
            }
            n => (0, u64::from(n)),
        };

        if payload_len > self.max_frame_size as u64 {
            return Err(WsProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let mask_len = if masked { 4 } else { 0 };
        let header_len = 2 + length_ext + mask_len;
        let total = header_len + payload_len as usize;
        if src.len() < total {
            return Ok(None);
        }

        src.advance(2 + length_ext);
        let mask_key = if masked {
            let key_bytes = src.split_to(4);
            let mut key = [0u8; 4];
            key.copy_from_slice(&key_bytes);
            Some(key)
        } else {
            None
        };

        let mut payload = src.split_to(payload_len as usize);
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(WsFrame {
            fin,
            opcode,
            masked,
            payload: payload.freeze(),
        }))
    }

    /// Append one encoded frame to `dst`.
    ///
    /// Client codecs mask the payload with a fresh random key; server
    /// codecs write it verbatim.
    pub fn encode(&mut self, frame: &WsFrame, dst: &mut BytesMut) -> Result<(), WsProtocolError> {
        let payload_len = frame.payload.len();

        if frame.is_control() {
            if !frame.fin {
                return Err(WsProtocolError::FragmentedControlFrame);
            }
            if payload_len > 125 {
                return Err(WsProtocolError::ControlFrameTooLarge(payload_len as u64));
            }
        }

        let mask = self.role == Role::Client;

        let mut b0 = frame.opcode as u8;
        if frame.fin {
            b0 |= 0x80;
        }
        let mask_bit = if mask { 0x80 } else { 0 };

        let length_ext = if payload_len > 65535 {
            8
        } else if payload_len > 125 {
            2
        } else {
            0
        };
        dst.reserve(2 + length_ext + if mask { 4 } else { 0 } + payload_len);

        dst.put_u8(b0);
        if payload_len <= 125 {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        if mask {
            let key = generate_mask_key();
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }
}

/// XOR `data` in place with the 4-byte masking key.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Fresh masking key from the system CSPRNG, as RFC 6455 Section 5.3
/// requires for client frames.
fn generate_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    getrandom::getrandom(&mut key).expect("system entropy source unavailable");
    key
}
