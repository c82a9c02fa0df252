//! Socket construction and tuning.
//!
//! `tokio::net` covers the common path; `socket2` fills in the options it
//! does not expose (dual-mode listeners, kernel buffer sizes, keepalive).

use std::io;
use std::net::{Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

/// Per-connection TCP options.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Enable TCP keepalive probes.
    pub keep_alive: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            no_delay: false,
            keep_alive: true,
        }
    }
}

/// Listener construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// Address to bind. With `dual_mode` the port is kept and the address
    /// is replaced by the IPv6 wildcard.
    pub endpoint: SocketAddr,
    /// Accept queue depth.
    pub backlog: u32,
    /// Listen on IPv6-any with IPv4-mapped addresses accepted.
    pub dual_mode: bool,
    /// Kernel receive buffer size; zero leaves the system default.
    pub receive_buffer: usize,
    /// Kernel send buffer size; zero leaves the system default.
    pub send_buffer: usize,
}

/// Bind a listener with the given tuning applied.
pub fn bind_listener(config: &ListenerConfig) -> io::Result<TcpListener> {
    let endpoint = if config.dual_mode {
        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), config.endpoint.port())
    } else {
        config.endpoint
    };

    let domain = Domain::for_address(endpoint);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if config.dual_mode {
        socket.set_only_v6(false)?;
    }
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;
    if config.receive_buffer > 0 {
        socket.set_recv_buffer_size(config.receive_buffer)?;
    }
    if config.send_buffer > 0 {
        socket.set_send_buffer_size(config.send_buffer)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&endpoint.into())?;
    socket.listen(config.backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// Apply per-connection options to an accepted or connected stream.
pub fn tune_stream(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.no_delay)?;
    SockRef::from(stream).set_keepalive(options.keep_alive)?;
    Ok(())
}
