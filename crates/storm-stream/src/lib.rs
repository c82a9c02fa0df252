//! Byte-stream transport for stormsocket.
//!
//! A [`Transport`] wraps one byte stream — an accepted or connected
//! socket, plaintext or TLS, or any other [`ByteStream`] such as an
//! in-memory `tokio::io::duplex` pair — and runs two pump tasks that
//! shuttle bytes between the stream and a pair of bounded in-memory
//! [`pipe`]s. The pipes give the rest of the
//! stack kernel-like backpressure without touching the socket directly:
//! when the outbound pipe fills up, `flush` suspends; when the inbound
//! pipe fills up, the transport stops reading from the socket.
//!
//! [`PipeConnection`] layers a [`Framer`](storm_wire::Framer) on top of a
//! transport: it drives the inbound message loop and frames outbound
//! payloads, reporting backpressure to the session above it.

#![deny(unsafe_code)]

mod connection;
mod pipe;
mod reconnect;
mod socket;
mod tls;
mod transport;

pub use connection::{BackpressureHook, FramerFactory, PipeConnection};
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use reconnect::{ReconnectAttempt, ReconnectOptions};
pub use socket::{bind_listener, tune_stream, ListenerConfig, SocketOptions};
pub use tls::{TlsClientOptions, TlsServerOptions};
pub use transport::{
    is_quiet_disconnect, ByteStream, MaybeTlsStream, SocketErrorHook, Transport,
    TransportOptions,
};
