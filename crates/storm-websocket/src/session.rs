//! WebSocket session: serialized frame writes, close handshake, and the
//! shared inbound frame loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use storm_session::{
    SendFilter, Session, SessionCore, SessionError, SessionState, SlowConsumerPolicy,
};
use storm_stream::{BackpressureHook, Transport};
use storm_wire::{
    close_status, parse_close_payload, Opcode, Role, WsFrame, WsFrameCodec, WsProtocolError,
};

use crate::heartbeat::Heartbeat;

/// Best-effort budget for putting a Close frame on the wire before the
/// transport is torn down anyway.
const CLOSE_WRITE_BUDGET: Duration = Duration::from_secs(5);

/// One delivered WebSocket message.
#[derive(Debug, Clone)]
pub struct WsMessage {
    /// Payload bytes.
    pub data: Bytes,
    /// Whether the frame was a text frame.
    pub is_text: bool,
}

impl WsMessage {
    /// Payload as UTF-8, when valid.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Message event payload.
#[derive(Debug, Clone)]
pub struct WsMessageEvent {
    /// Session the message arrived on.
    pub session: Arc<WsSession>,
    /// The message.
    pub message: WsMessage,
}

/// Error event payload.
#[derive(Debug, Clone)]
pub struct WsErrorEvent {
    /// Session the error belongs to.
    pub session: Arc<WsSession>,
    /// The error itself.
    pub error: Arc<SessionError>,
}

/// One live WebSocket connection.
///
/// Every outbound frame (user sends, heartbeat pings, auto-pongs, the
/// Close frame) goes through a single writer lock, so frames from racing
/// tasks never interleave on the wire. Server sessions emit unmasked
/// frames; client sessions mask every frame with a fresh key.
pub struct WsSession {
    core: SessionCore,
    transport: Arc<Transport>,
    write: tokio::sync::Mutex<WsFrameCodec>,
    backpressured: AtomicBool,
    backpressure_reported: AtomicBool,
    on_backpressure: Mutex<Option<BackpressureHook>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    send_filter: Mutex<Option<SendFilter>>,
}

impl WsSession {
    pub(crate) fn new(
        transport: Arc<Transport>,
        role: Role,
        max_frame_size: usize,
        remote_addr: Option<SocketAddr>,
        policy: SlowConsumerPolicy,
    ) -> Self {
        Self {
            core: SessionCore::new(remote_addr, policy),
            transport,
            write: tokio::sync::Mutex::new(WsFrameCodec::new(role).max_frame_size(max_frame_size)),
            backpressured: AtomicBool::new(false),
            backpressure_reported: AtomicBool::new(false),
            on_backpressure: Mutex::new(None),
            heartbeat: Mutex::new(None),
            send_filter: Mutex::new(None),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub(crate) fn set_backpressure_hook(&self, hook: BackpressureHook) {
        *self.on_backpressure.lock().unwrap() = Some(hook);
    }

    pub(crate) fn set_send_filter(&self, filter: SendFilter) {
        *self.send_filter.lock().unwrap() = Some(filter);
    }

    pub(crate) fn attach_heartbeat(&self, heartbeat: Heartbeat) {
        *self.heartbeat.lock().unwrap() = Some(heartbeat);
    }

    pub(crate) fn pong_received(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().unwrap().as_ref() {
            heartbeat.pong_received();
        }
    }

    async fn shutdown_heartbeat(&self) {
        let heartbeat = self.heartbeat.lock().unwrap().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.shutdown().await;
        }
    }

    /// Send a text frame.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send_frame(WsFrame::text(text.into())).await
    }

    /// Send a binary frame.
    pub async fn send_binary(&self, data: Bytes) -> Result<(), SessionError> {
        self.send_frame(WsFrame::binary(data)).await
    }

    /// Send a ping frame.
    pub async fn ping(&self, payload: Bytes) -> Result<(), SessionError> {
        self.send_control(WsFrame::ping(payload)).await
    }

    pub(crate) async fn send_pong(&self, payload: Bytes) -> Result<(), SessionError> {
        self.send_control(WsFrame::pong(payload)).await
    }

    async fn send_frame(&self, frame: WsFrame) -> Result<(), SessionError> {
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
        let frame = match filter {
            Some(filter) => match filter(frame.payload.clone()).await {
                Some(payload) => WsFrame { payload, ..frame },
                None => return Ok(()),
            },
            None => frame,
        };

        let payload_len = frame.payload.len() as u64;
        self.transmit(&frame).await?;
        self.core.metrics().add_sent(payload_len);
        Ok(())
    }

    async fn send_control(&self, frame: WsFrame) -> Result<(), SessionError> {
        if self.core.is_close_started() {
            return Ok(());
        }
        self.transmit(&frame).await
    }

    /// Encode under the writer lock, append to the outbound pipe, then
    /// flush (outside the lock; chunk appends are atomic, so frame bytes
    /// cannot interleave).
    async fn transmit(&self, frame: &WsFrame) -> Result<(), SessionError> {
        {
            // Uncontended sends skip the scheduler hop.
            let mut codec = match self.write.try_lock() {
                Ok(guard) => guard,
                Err(_) => self.write.lock().await,
            };
            let mut buf = BytesMut::with_capacity(frame.payload.len() + 16);
            codec
                .encode(frame, &mut buf)
                .map_err(std::io::Error::from)?;
            self.transport.output().write(buf.freeze())?;
        }

        let output = self.transport.output();
        if !output.is_saturated() {
            return Ok(());
        }

        self.backpressured.store(true, Ordering::Release);
        if !self.backpressure_reported.swap(true, Ordering::AcqRel) {
            let hook = self.on_backpressure.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
        let flushed = output.flush().await;
        self.backpressured.store(false, Ordering::Release);
        flushed.map_err(SessionError::from)
    }

    /// Gracefully close with an explicit status code.
    ///
    /// Emits a Close frame (status sanitized to a sendable code), shuts
    /// the heartbeat down, and closes the transport. Idempotent.
    pub async fn close_with(&self, status: u16) -> Result<(), SessionError> {
        if !self.core.begin_close() {
            return Ok(());
        }
        self.core.advance_state(SessionState::Closing);

        let frame = WsFrame::close(Some(close_status::sanitize(status)));
        // Best effort: a peer that stopped reading must not wedge the
        // teardown.
        match tokio::time::timeout(CLOSE_WRITE_BUDGET, self.transmit(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => trace!(%err, "close frame not delivered"),
            Err(_) => debug!("close frame write timed out"),
        }

        self.shutdown_heartbeat().await;
        self.transport.close().await;
        self.core.advance_state(SessionState::Closed);
        Ok(())
    }
}

#[async_trait]
impl Session for WsSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn is_backpressured(&self) -> bool {
        self.backpressured.load(Ordering::Acquire)
    }

    /// Binary send; see [`WsSession::send_text`] for text frames.
    async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        self.send_binary(data).await
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.close_with(close_status::NORMAL).await
    }

    async fn abort(&self) {
        if !self.core.begin_close() {
            return;
        }
        self.core.advance_state(SessionState::Closing);
        self.shutdown_heartbeat().await;
        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.close().await;
        });
        self.core.advance_state(SessionState::Closed);
    }
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .field("remote_addr", &self.core.remote_addr())
            .finish_non_exhaustive()
    }
}

/// Why the inbound frame loop ended.
#[derive(Debug)]
pub(crate) enum LoopEnd {
    /// Peer sent a Close frame.
    PeerClosed { status: Option<u16> },
    /// Transport reached EOF without a close handshake.
    Eof,
    /// The server or client is shutting down.
    Cancelled,
    /// The peer violated the protocol.
    Protocol(WsProtocolError),
}

/// Drive the inbound frame loop for one session.
///
/// `leftover` carries bytes that arrived pipelined behind the HTTP
/// upgrade. Data frames (including reassembled fragmented messages) are
/// handed to `on_message` in arrival order; control frames are handled
/// inline: pings answered when `auto_pong` is set, pongs fed to the
/// heartbeat, Close ends the loop.
pub(crate) async fn run_frame_loop<F, Fut>(
    session: &Arc<WsSession>,
    role: Role,
    max_frame_size: usize,
    leftover: BytesMut,
    cancel: &CancellationToken,
    auto_pong: bool,
    mut on_message: F,
) -> LoopEnd
where
    F: FnMut(WsMessage) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut codec = WsFrameCodec::new(role).max_frame_size(max_frame_size);
    let mut acc = leftover;
    let mut fragments: Option<(Opcode, BytesMut)> = None;

    loop {
        loop {
            let frame = match codec.decode(&mut acc) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => return LoopEnd::Protocol(err),
            };

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    if fragments.is_some() {
                        return LoopEnd::Protocol(WsProtocolError::Violation(
                            "data frame while a fragmented message is in progress",
                        ));
                    }
                    if frame.fin {
                        deliver(session, &mut on_message, frame.opcode, frame.payload).await;
                    } else {
                        fragments = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                    }
                }
                Opcode::Continuation => {
                    let Some((opcode, mut buffer)) = fragments.take() else {
                        return LoopEnd::Protocol(WsProtocolError::Violation(
                            "continuation frame without a fragmented message",
                        ));
                    };
                    if buffer.len() + frame.payload.len() > max_frame_size {
                        return LoopEnd::Protocol(WsProtocolError::FrameTooLarge {
                            size: (buffer.len() + frame.payload.len()) as u64,
                            max: max_frame_size,
                        });
                    }
                    buffer.extend_from_slice(&frame.payload);
                    if frame.fin {
                        deliver(session, &mut on_message, opcode, buffer.freeze()).await;
                    } else {
                        fragments = Some((opcode, buffer));
                    }
                }
                Opcode::Ping => {
                    if auto_pong {
                        if let Err(err) = session.send_pong(frame.payload).await {
                            trace!(%err, "auto-pong failed");
                        }
                    }
                }
                Opcode::Pong => session.pong_received(),
                Opcode::Close => {
                    let (status, _reason) = parse_close_payload(&frame.payload);
                    return LoopEnd::PeerClosed { status };
                }
            }
        }

        let chunk = tokio::select! {
            () = cancel.cancelled() => return LoopEnd::Cancelled,
            chunk = session.transport().input().read() => chunk,
        };
        match chunk {
            Some(chunk) => acc.extend_from_slice(&chunk),
            None => return LoopEnd::Eof,
        }
    }
}

async fn deliver<F, Fut>(session: &Arc<WsSession>, on_message: &mut F, opcode: Opcode, data: Bytes)
where
    F: FnMut(WsMessage) -> Fut,
    Fut: Future<Output = ()>,
{
    session.core().metrics().add_received(data.len() as u64);
    on_message(WsMessage {
        data,
        is_text: opcode == Opcode::Text,
    })
    .await;
}
