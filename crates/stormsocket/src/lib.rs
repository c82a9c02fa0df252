//! stormsocket - event-driven TCP and WebSocket networking.
//!
//! This crate provides a unified API over the component crates. Users
//! should depend on this crate rather than the individual pieces.
//!
//! ```ignore
//! use stormsocket::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut server = WsServer::new(WsServerOptions::new("0.0.0.0:9000".parse().unwrap()));
//!     server.on_message_received(|event| async move {
//!         if event.message.is_text {
//!             let text = event.message.text().unwrap_or_default().to_string();
//!             let _ = event.session.send_text(text).await;
//!         }
//!     });
//!     server.start().await?;
//!     // ... run until shutdown, then:
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

// Wire-level codecs: framers, the RFC 6455 frame codec, upgrade
// parsing/building.
pub use storm_wire as wire;

pub use storm_wire::{
    close_status, compute_accept_key, DelimiterFramer, Framer, FramerError, LengthPrefixFramer,
    Opcode, RawFramer, Role, UpgradeError, WsFrame, WsFrameCodec, WsProtocolError, WsUrl,
};

// Transport: bounded pipes, TLS options, socket tuning.
pub use storm_stream as stream;

pub use storm_stream::{
    pipe, ByteStream, PipeConnection, PipeReader, PipeWriter, ReconnectAttempt,
    ReconnectOptions, SocketOptions, TlsClientOptions, TlsServerOptions, Transport,
    TransportOptions,
};

// Session model: registry, groups, middleware, events.
pub use storm_session as session;

pub use storm_session::{
    EventHandlers, MetricsSnapshot, Middleware, MiddlewarePipeline, Session, SessionGroup,
    SessionId, SessionManager, SessionState, SlowConsumerPolicy,
};

// Endpoints.
pub use storm_tcp as tcp;
pub use storm_websocket as websocket;

pub use storm_tcp::{
    ConnectError, TcpClient, TcpClientOptions, TcpDataEvent, TcpErrorEvent, TcpServer,
    TcpServerOptions, TcpSession,
};
pub use storm_websocket::{
    HeartbeatOptions, WebSocketOptions, WsClient, WsClientOptions, WsConnectError, WsMessage,
    WsMessageEvent, WsServer, WsServerOptions, WsSession, WsUpgradeContext,
};

// Re-export tracing so applications can hook subscribers without adding
// the dependency themselves.
pub use tracing;

/// Convenient imports for the common cases.
pub mod prelude {
    pub use crate::{
        Session as _, SlowConsumerPolicy, TcpClient, TcpClientOptions, TcpServer,
        TcpServerOptions, WsClient, WsClientOptions, WsServer, WsServerOptions,
    };
}
