//! Message framers for raw TCP streams.
//!
//! A [`Framer`] turns a byte stream into discrete messages and back. The
//! decode side is fed an accumulation buffer: it either consumes a complete
//! message (plus any framing overhead) from the front of the buffer, or
//! leaves the buffer untouched and asks for more bytes by returning
//! `Ok(None)`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default delimiter byte for [`DelimiterFramer`] (newline).
pub const DEFAULT_DELIMITER: u8 = b'\n';

/// Maximum payload accepted by [`LengthPrefixFramer`] (16 MiB).
pub const MAX_LENGTH_PREFIX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Errors produced by framers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerError {
    /// A length-prefixed frame declared a length that is out of range.
    ///
    /// Lengths with the sign bit set (the wire format is a 32-bit
    /// big-endian integer) land here as well, since they exceed the cap by
    /// a wide margin.
    InvalidLength {
        /// Declared payload length.
        length: u64,
        /// Maximum accepted payload length.
        max: usize,
    },
    /// An outbound payload does not fit the framing discipline.
    PayloadTooLarge {
        /// Payload length handed to `encode`.
        length: usize,
        /// Maximum accepted payload length.
        max: usize,
    },
}

impl fmt::Display for FramerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength { length, max } => {
                write!(f, "invalid frame length {length} (max {max})")
            }
            Self::PayloadTooLarge { length, max } => {
                write!(f, "payload of {length} bytes exceeds frame limit of {max}")
            }
        }
    }
}

impl std::error::Error for FramerError {}

impl From<FramerError> for std::io::Error {
    fn from(err: FramerError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// Strategy that splits an inbound byte stream into messages and writes
/// outbound messages with a chosen framing discipline.
pub trait Framer: Send {
    /// Try to extract one complete message from the front of `src`.
    ///
    /// On success the message bytes and their framing overhead are consumed
    /// from `src`. `Ok(None)` means more bytes are needed; in that case
    /// `src` is left intact.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramerError>;

    /// Append one framed message to `dst`.
    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FramerError>;
}

/// No framing: each decode call drains whatever bytes are available and
/// hands them over as a single message.
///
/// Used when the application handles message boundaries itself (or does not
/// care about them, as in a plain echo).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFramer;

impl Framer for RawFramer {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramerError> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(src.split().freeze()))
    }

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FramerError> {
        dst.extend_from_slice(payload);
        Ok(())
    }
}

/// `[u32 big-endian length][payload]` framing.
///
/// The length header counts payload bytes only. Frames above the configured
/// cap (or whose header has the sign bit set) fail with
/// [`FramerError::InvalidLength`] and the connection is expected to be torn
/// down; there is no way to resynchronize after a corrupt header.
#[derive(Debug, Clone)]
pub struct LengthPrefixFramer {
    max_length: usize,
}

impl LengthPrefixFramer {
    /// Create a framer with the default 16 MiB payload cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LENGTH_PREFIX_PAYLOAD)
    }

    /// Create a framer with a custom payload cap.
    ///
    /// The cap is clamped to the wire-format maximum of 16 MiB.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.min(MAX_LENGTH_PREFIX_PAYLOAD),
        }
    }

    /// Payload cap enforced by this framer.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LengthPrefixFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer for LengthPrefixFramer {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramerError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let header = [src[0], src[1], src[2], src[3]];
        let declared = u32::from_be_bytes(header);

        // The wire format is a signed 32-bit length in the original
        // protocol; anything with the sign bit set is invalid, and so is
        // anything above the cap.
        if declared > i32::MAX as u32 || declared as usize > self.max_length {
            return Err(FramerError::InvalidLength {
                length: u64::from(declared),
                max: self.max_length,
            });
        }

        let length = declared as usize;
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FramerError> {
        if payload.len() > self.max_length {
            return Err(FramerError::PayloadTooLarge {
                length: payload.len(),
                max: self.max_length,
            });
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(payload);
        Ok(())
    }
}

/// `[payload][delimiter byte]` framing.
///
/// The delimiter is stripped on decode and appended on encode. Defaults to
/// newline, which makes this the line protocol framer.
#[derive(Debug, Clone)]
pub struct DelimiterFramer {
    delimiter: u8,
    /// Offset into the buffer that has already been scanned for the
    /// delimiter, so partial reads do not rescan the same bytes.
    scanned: usize,
}

impl DelimiterFramer {
    /// Create a framer splitting on newline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_delimiter(DEFAULT_DELIMITER)
    }

    /// Create a framer splitting on an arbitrary byte.
    #[must_use]
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self {
            delimiter,
            scanned: 0,
        }
    }

    /// The delimiter byte in use.
    #[must_use]
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }
}

impl Default for DelimiterFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer for DelimiterFramer {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramerError> {
        debug_assert!(self.scanned <= src.len());
        let Some(offset) = src[self.scanned..]
            .iter()
            .position(|b| *b == self.delimiter)
        else {
            self.scanned = src.len();
            return Ok(None);
        };

        let end = self.scanned + offset;
        let message = src.split_to(end).freeze();
        src.advance(1); // the delimiter itself
        self.scanned = 0;
        Ok(Some(message))
    }

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FramerError> {
        dst.reserve(payload.len() + 1);
        dst.extend_from_slice(payload);
        dst.put_u8(self.delimiter);
        Ok(())
    }
}
