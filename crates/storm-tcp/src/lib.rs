//! Raw TCP endpoints for stormsocket.
//!
//! [`TcpServer`] listens, accepts, and runs one framed session per
//! connection; [`TcpClient`] dials out, optionally with TLS and automatic
//! reconnection. Both deliver messages and lifecycle changes through
//! subscribed event handlers.

#![deny(unsafe_code)]

mod client;
mod server;
mod session;

pub use client::{ConnectError, TcpClient, TcpClientEvents, TcpClientOptions};
pub use server::{TcpServer, TcpServerEvents, TcpServerOptions};
pub use session::{TcpDataEvent, TcpErrorEvent, TcpSession};
