//! Wire-level codecs for stormsocket.
//!
//! This crate contains everything that touches raw bytes but not sockets:
//!
//! - [`Framer`] and its implementations ([`RawFramer`], [`LengthPrefixFramer`],
//!   [`DelimiterFramer`]) split an inbound TCP byte stream into discrete
//!   messages and frame outbound messages.
//! - [`WsFrameCodec`] encodes and decodes RFC 6455 WebSocket frames,
//!   masked and unmasked.
//! - [`upgrade`] parses and builds the HTTP/1.1 upgrade request/response
//!   for both the server and the client side of the handshake.
//!
//! Nothing here performs I/O; callers feed accumulated bytes in and write
//! produced bytes out through whatever transport they own.

#![deny(unsafe_code)]

mod framer;
pub mod upgrade;
mod ws;

pub use framer::{DelimiterFramer, Framer, FramerError, LengthPrefixFramer, RawFramer};
pub use upgrade::{
    compute_accept_key, ClientUpgrade, UpgradeError, UpgradeRequest, UpgradeResponse, WsUrl,
};
pub use ws::{
    close_status, encode_close_payload, parse_close_payload, Opcode, Role, WsFrame, WsFrameCodec,
    WsProtocolError,
};
