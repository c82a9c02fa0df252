//! Raw TCP session.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use storm_session::{
    SendFilter, Session, SessionCore, SessionError, SessionState, SlowConsumerPolicy,
};
use storm_stream::PipeConnection;

/// Payload delivered by a TCP session.
#[derive(Debug, Clone)]
pub struct TcpDataEvent {
    /// Session the data arrived on.
    pub session: Arc<TcpSession>,
    /// Message bytes, as split by the session's framer.
    pub data: Bytes,
}

/// Error surfaced on a TCP session's connection.
#[derive(Debug, Clone)]
pub struct TcpErrorEvent {
    /// Session the error belongs to.
    pub session: Arc<TcpSession>,
    /// The error itself.
    pub error: Arc<SessionError>,
}

/// One live TCP connection with framing, metrics, and a slow-consumer
/// policy.
///
/// All sends go through a single writer lock, so concurrent callers never
/// interleave frame bytes on the wire; contending sends complete in lock
/// acquisition order.
pub struct TcpSession {
    core: SessionCore,
    connection: Arc<PipeConnection>,
    write_lock: tokio::sync::Mutex<()>,
    send_filter: std::sync::Mutex<Option<SendFilter>>,
}

impl TcpSession {
    pub(crate) fn new(
        connection: Arc<PipeConnection>,
        remote_addr: Option<SocketAddr>,
        policy: SlowConsumerPolicy,
    ) -> Self {
        Self {
            core: SessionCore::new(remote_addr, policy),
            connection,
            write_lock: tokio::sync::Mutex::new(()),
            send_filter: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn set_send_filter(&self, filter: SendFilter) {
        *self.send_filter.lock().unwrap() = Some(filter);
    }
}

#[async_trait]
impl Session for TcpSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn is_backpressured(&self) -> bool {
        self.connection.is_backpressured()
    }

    async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        if self.core.state() != SessionState::Connected || self.core.is_close_started() {
            return Err(SessionError::NotConnected);
        }

        match self.core.policy() {
            SlowConsumerPolicy::Drop if self.is_backpressured() => return Ok(()),
            SlowConsumerPolicy::Disconnect if self.is_backpressured() => {
                self.abort().await;
                return Ok(());
            }
            _ => {}
        }

        let filter = self.send_filter.lock().unwrap().clone();
        let data = match filter {
            Some(filter) => match filter(data).await {
                Some(data) => data,
                None => return Ok(()),
            },
            None => data,
        };

        // Uncontended sends skip the scheduler hop.
        let _guard = match self.write_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => self.write_lock.lock().await,
        };
        if self.core.is_close_started() {
            return Err(SessionError::NotConnected);
        }
        self.connection.send(&data).await?;
        self.core.metrics().add_sent(data.len() as u64);
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if !self.core.begin_close() {
            return Ok(());
        }
        self.core.advance_state(SessionState::Closing);
        // No closing handshake on raw TCP; shutting the transport down
        // unblocks any send still waiting on a flush.
        self.connection.transport().close().await;
        self.core.advance_state(SessionState::Closed);
        Ok(())
    }

    async fn abort(&self) {
        if !self.core.begin_close() {
            return;
        }
        self.core.advance_state(SessionState::Closing);
        let transport = self.connection.transport().clone();
        tokio::spawn(async move {
            transport.close().await;
        });
    }
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .field("remote_addr", &self.core.remote_addr())
            .finish_non_exhaustive()
    }
}
