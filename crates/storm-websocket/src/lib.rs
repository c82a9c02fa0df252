//! RFC 6455 WebSocket endpoints for stormsocket.
//!
//! [`WsServer`] accepts TCP (or TLS) sockets, runs the HTTP upgrade with a
//! deadline and optional authorization hook, and then speaks the frame
//! protocol: data frames flow through middleware to message events,
//! pings are answered automatically, pongs feed the heartbeat, and the
//! close handshake is echoed. [`WsClient`] is the dialing counterpart
//! with masked frames and auto-reconnect.

#![deny(unsafe_code)]

mod client;
mod context;
mod heartbeat;
mod server;
mod session;

pub use client::{WsClient, WsClientEvents, WsClientOptions, WsConnectError};
pub use context::{ContextError, WsUpgradeContext};
pub use heartbeat::{Heartbeat, HeartbeatOptions};
pub use server::{WebSocketOptions, WsServer, WsServerEvents, WsServerOptions};
pub use session::{WsErrorEvent, WsMessage, WsMessageEvent, WsSession};
