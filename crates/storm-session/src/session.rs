//! Session state, metrics, and the protocol-agnostic session trait.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use crate::id::{next_session_id, SessionId};

/// Lifecycle state of a session.
///
/// Transitions are monotonic: Connecting → Connected → Closing → Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Transport or protocol handshake in progress.
    Connecting = 0,
    /// Fully established; sends are accepted.
    Connected = 1,
    /// Close handshake or teardown started.
    Closing = 2,
    /// Fully torn down.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What a session does with a send when its peer is not keeping up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlowConsumerPolicy {
    /// Await the flush; the send completes once the buffer drains.
    #[default]
    Wait,
    /// Drop the payload without queueing it; metrics are unchanged.
    Drop,
    /// Abort the connection as soon as backpressure is observed.
    Disconnect,
}

/// Atomic transfer counters for one session.
#[derive(Debug)]
pub struct SessionMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connected_at: SystemTime,
    connected_instant: Instant,
}

impl SessionMetrics {
    fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connected_at: SystemTime::now(),
            connected_instant: Instant::now(),
        }
    }

    /// Record a completed send of `n` payload bytes.
    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Record `n` received payload bytes.
    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connected_at: self.connected_at,
            uptime: self.connected_instant.elapsed(),
        }
    }
}

/// Copy of a session's metrics at one instant.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    /// Payload bytes successfully flushed to the transport.
    pub bytes_sent: u64,
    /// Payload bytes received from the transport.
    pub bytes_received: u64,
    /// Wall-clock connection time.
    pub connected_at: SystemTime,
    /// Time since the session connected.
    pub uptime: Duration,
}

/// Errors surfaced by session operations.
#[derive(Debug)]
pub enum SessionError {
    /// The session is not in the Connected state.
    NotConnected,
    /// Transport or protocol failure.
    Io(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "session is not connected"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::NotConnected => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Identity and bookkeeping shared by every session implementation.
#[derive(Debug)]
pub struct SessionCore {
    id: SessionId,
    state: AtomicU8,
    metrics: SessionMetrics,
    remote_addr: Option<SocketAddr>,
    policy: SlowConsumerPolicy,
    groups: Mutex<HashSet<String>>,
    close_guard: AtomicBool,
}

impl SessionCore {
    /// Allocate a fresh id and start in the Connecting state.
    #[must_use]
    pub fn new(remote_addr: Option<SocketAddr>, policy: SlowConsumerPolicy) -> Self {
        Self {
            id: next_session_id(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            metrics: SessionMetrics::new(),
            remote_addr,
            policy,
            groups: Mutex::new(HashSet::new()),
            close_guard: AtomicBool::new(false),
        }
    }

    /// This session's id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state machine. States only move forward; an attempt to
    /// go backwards is ignored. Returns whether the state changed.
    pub fn advance_state(&self, to: SessionState) -> bool {
        self.state.fetch_max(to as u8, Ordering::AcqRel) < to as u8
    }

    /// Remote peer address.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Slow-consumer policy for this session.
    #[must_use]
    pub fn policy(&self) -> SlowConsumerPolicy {
        self.policy
    }

    /// Transfer counters.
    #[must_use]
    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Claim the single-shot close guard. The first caller gets `true`
    /// and runs the teardown; everyone else backs off.
    pub fn begin_close(&self) -> bool {
        self.close_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether close or abort has started. Once set, no further user
    /// write enters the transport.
    #[must_use]
    pub fn is_close_started(&self) -> bool {
        self.close_guard.load(Ordering::Acquire)
    }

    /// Snapshot of the groups this session belongs to.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.groups.lock().unwrap().iter().cloned().collect()
    }

    pub(crate) fn add_group(&self, name: &str) {
        self.groups.lock().unwrap().insert(name.to_string());
    }

    pub(crate) fn remove_group(&self, name: &str) {
        self.groups.lock().unwrap().remove(name);
    }
}

/// A live bidirectional endpoint over a single transport.
///
/// Object-safe so registries and broadcast code can hold mixed session
/// types; the TCP and WebSocket crates provide the implementations.
#[async_trait]
pub trait Session: Send + Sync {
    /// Shared identity/bookkeeping state.
    fn core(&self) -> &SessionCore;

    /// True while an outbound flush is suspended waiting for the peer.
    fn is_backpressured(&self) -> bool;

    /// Send a payload (framed per the session's protocol).
    ///
    /// Requires the Connected state. Subject to the slow-consumer policy:
    /// `Drop` returns without queueing while backpressured, `Disconnect`
    /// aborts the session instead.
    async fn send(&self, data: Bytes) -> Result<(), SessionError>;

    /// Gracefully close the session. Idempotent.
    async fn close(&self) -> Result<(), SessionError>;

    /// Tear the session down without any closing handshake. Idempotent.
    async fn abort(&self);

    /// Session id.
    fn id(&self) -> SessionId {
        self.core().id()
    }

    /// Lifecycle state.
    fn state(&self) -> SessionState {
        self.core().state()
    }

    /// Remote peer address.
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.core().remote_addr()
    }

    /// Point-in-time metrics.
    fn metrics(&self) -> MetricsSnapshot {
        self.core().metrics().snapshot()
    }

    /// Slow-consumer policy.
    fn policy(&self) -> SlowConsumerPolicy {
        self.core().policy()
    }

    /// Groups this session currently belongs to.
    fn groups(&self) -> Vec<String> {
        self.core().groups()
    }
}
