//! WebSocket server orchestrator: accept, upgrade with deadline,
//! authorization hook, heartbeat wiring, frame loop, broadcast, and
//! shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use storm_session::{
    EventHandlers, Middleware, MiddlewarePipeline, Session, SessionError, SessionGroup,
    SessionId, SessionManager, SessionState, SlowConsumerPolicy,
};
use storm_stream::{
    bind_listener, tune_stream, ListenerConfig, PipeReader, SocketOptions, TlsServerOptions,
    Transport, TransportOptions,
};
use storm_wire::upgrade::{build_accept_response, build_error_response, build_reject_response};
use storm_wire::{close_status, compute_accept_key, Role, UpgradeError, UpgradeRequest};

use crate::context::WsUpgradeContext;
use crate::heartbeat::{Heartbeat, HeartbeatOptions};
use crate::session::{run_frame_loop, LoopEnd, WsErrorEvent, WsMessageEvent, WsSession};

/// WebSocket protocol settings.
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// Ping cadence and tolerance.
    pub heartbeat: HeartbeatOptions,
    /// Maximum accepted frame (and reassembled message) payload.
    pub max_frame_size: usize,
    /// Origin allow-list; empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Deadline for the HTTP upgrade after the socket is accepted.
    pub handshake_timeout: Duration,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatOptions::default(),
            max_frame_size: 1024 * 1024,
            allowed_origins: Vec::new(),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// WebSocket server configuration.
#[derive(Clone)]
pub struct WsServerOptions {
    /// Address to listen on.
    pub endpoint: SocketAddr,
    /// Accept queue depth.
    pub backlog: u32,
    /// Listen on IPv6-any and accept both families.
    pub dual_mode: bool,
    /// Kernel receive buffer size.
    pub receive_buffer: usize,
    /// Kernel send buffer size.
    pub send_buffer: usize,
    /// Inbound pipe bound per connection; zero disables.
    pub max_pending_receive_bytes: usize,
    /// Outbound pipe bound per connection; zero disables.
    pub max_pending_send_bytes: usize,
    /// Refuse sockets beyond this many live sessions; zero is unlimited.
    pub max_connections: usize,
    /// Slow-consumer policy applied to every session.
    pub slow_consumer_policy: SlowConsumerPolicy,
    /// TLS settings; plaintext when absent.
    pub tls: Option<TlsServerOptions>,
    /// Per-connection socket tuning.
    pub socket: SocketOptions,
    /// Protocol-level settings.
    pub websocket: WebSocketOptions,
}

impl WsServerOptions {
    /// Defaults for the given listen address.
    #[must_use]
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            backlog: 128,
            dual_mode: false,
            receive_buffer: 65536,
            send_buffer: 65536,
            max_pending_receive_bytes: 1024 * 1024,
            max_pending_send_bytes: 1024 * 1024,
            max_connections: 0,
            slow_consumer_policy: SlowConsumerPolicy::Wait,
            tls: None,
            socket: SocketOptions::default(),
            websocket: WebSocketOptions::default(),
        }
    }
}

impl std::fmt::Debug for WsServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServerOptions")
            .field("endpoint", &self.endpoint)
            .field("max_connections", &self.max_connections)
            .field("websocket", &self.websocket)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// Subscriber lists for server lifecycle events.
#[derive(Debug, Default)]
pub struct WsServerEvents {
    /// An upgrade request arrived; subscribers may accept or reject it.
    pub connecting: EventHandlers<Arc<WsUpgradeContext>>,
    /// A session completed the upgrade and is registered.
    pub connected: EventHandlers<Arc<WsSession>>,
    /// A session was torn down and removed.
    pub disconnected: EventHandlers<Arc<WsSession>>,
    /// A data message arrived (after middleware).
    pub message_received: EventHandlers<WsMessageEvent>,
    /// An error surfaced on a session's connection.
    pub error: EventHandlers<WsErrorEvent>,
    /// A socket error that is not an expected disconnect.
    pub socket_error: EventHandlers<Arc<io::Error>>,
}

struct ServerShared {
    options: WsServerOptions,
    events: WsServerEvents,
    middleware: MiddlewarePipeline<WsSession>,
    sessions: SessionManager<WsSession>,
    groups: SessionGroup<WsSession>,
    shutdown: CancellationToken,
}

/// RFC 6455 WebSocket server.
pub struct WsServer {
    options: WsServerOptions,
    events: WsServerEvents,
    middleware: MiddlewarePipeline<WsSession>,
    shared: Option<Arc<ServerShared>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl WsServer {
    /// Server with the given options.
    #[must_use]
    pub fn new(options: WsServerOptions) -> Self {
        Self {
            options,
            events: WsServerEvents::default(),
            middleware: MiddlewarePipeline::new(),
            shared: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Subscribe to upgrade requests (authorization hook). If no
    /// subscriber decides the context, it is auto-accepted.
    pub fn on_connecting<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<WsUpgradeContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.connecting.subscribe(handler);
    }

    /// Subscribe to session connects.
    pub fn on_connected<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<WsSession>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.connected.subscribe(handler);
    }

    /// Subscribe to session disconnects.
    pub fn on_disconnected<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<WsSession>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.disconnected.subscribe(handler);
    }

    /// Subscribe to inbound messages.
    pub fn on_message_received<F, Fut>(&mut self, handler: F)
    where
        F: Fn(WsMessageEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.message_received.subscribe(handler);
    }

    /// Subscribe to session errors.
    pub fn on_error<F, Fut>(&mut self, handler: F)
    where
        F: Fn(WsErrorEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.error.subscribe(handler);
    }

    /// Subscribe to unexpected socket errors.
    pub fn on_socket_error<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<io::Error>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.socket_error.subscribe(handler);
    }

    /// Append a middleware stage. Must be called before `start`.
    pub fn use_middleware<M: Middleware<WsSession> + 'static>(&mut self, stage: M) {
        self.middleware = std::mem::take(&mut self.middleware).with(stage);
    }

    /// Bind and start accepting.
    pub async fn start(&mut self) -> io::Result<()> {
        self.start_with(CancellationToken::new()).await
    }

    /// Bind and start accepting; `cancel` stops the server like
    /// [`WsServer::stop`] does.
    pub async fn start_with(&mut self, cancel: CancellationToken) -> io::Result<()> {
        if self.shared.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "server already started",
            ));
        }

        let listener = bind_listener(&ListenerConfig {
            endpoint: self.options.endpoint,
            backlog: self.options.backlog,
            dual_mode: self.options.dual_mode,
            receive_buffer: self.options.receive_buffer,
            send_buffer: self.options.send_buffer,
        })?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            options: self.options.clone(),
            events: std::mem::take(&mut self.events),
            middleware: self.middleware.clone(),
            sessions: SessionManager::new(),
            groups: SessionGroup::new(),
            shutdown: cancel,
        });

        info!(%local_addr, "websocket server listening");
        self.accept_task = Some(tokio::spawn(accept_loop(shared.clone(), listener)));
        self.local_addr = Some(local_addr);
        self.shared = Some(shared);
        Ok(())
    }

    /// Bound address (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared
            .as_ref()
            .map(|shared| shared.sessions.len())
            .unwrap_or(0)
    }

    /// The session registry, once started.
    #[must_use]
    pub fn sessions(&self) -> Option<&SessionManager<WsSession>> {
        self.shared.as_ref().map(|shared| &shared.sessions)
    }

    /// The group registry, once started.
    #[must_use]
    pub fn groups(&self) -> Option<&SessionGroup<WsSession>> {
        self.shared.as_ref().map(|shared| &shared.groups)
    }

    /// Send a text frame to every session except `exclude`.
    pub async fn broadcast_text(&self, text: &str, exclude: Option<SessionId>) {
        let Some(shared) = &self.shared else { return };
        let sends = shared
            .sessions
            .snapshot()
            .into_iter()
            .filter(|session| Some(session.id()) != exclude)
            .map(|session| {
                let text = text.to_string();
                async move {
                    if let Err(err) = session.send_text(text).await {
                        debug!(session = %session.id(), %err, "broadcast send failed");
                    }
                }
            });
        join_all(sends).await;
    }

    /// Send a binary frame to every session except `exclude`.
    pub async fn broadcast_binary(&self, data: Bytes, exclude: Option<SessionId>) {
        if let Some(shared) = &self.shared {
            shared.sessions.broadcast(data, exclude).await;
        }
    }

    /// Stop accepting, tell every session the server is going away
    /// (Close 1001), and close them all.
    pub async fn stop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        let goodbyes = shared.sessions.snapshot().into_iter().map(|session| async move {
            let _ = session.close_with(close_status::GOING_AWAY).await;
        });
        join_all(goodbyes).await;
        shared.sessions.close_all().await;
        self.local_addr = None;
    }
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("endpoint", &self.options.endpoint)
            .field("started", &self.shared.is_some())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: tokio::net::TcpListener) {
    loop {
        let accepted = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let limit = shared.options.max_connections;
                if limit > 0 && shared.sessions.len() >= limit {
                    debug!(%peer, limit, "connection limit reached, refusing socket");
                    drop(stream);
                    continue;
                }
                tokio::spawn(handle_connection(shared.clone(), stream, peer));
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("accept loop stopped");
}

enum UpgradeOutcome {
    Upgraded {
        request: UpgradeRequest,
        leftover: BytesMut,
    },
    /// The connection must be closed without a session; a response may
    /// already have been written.
    Refused,
}

/// Read and answer the HTTP upgrade. Never creates a session; the caller
/// closes the transport on [`UpgradeOutcome::Refused`].
async fn run_upgrade(shared: &Arc<ServerShared>, transport: &Arc<Transport>) -> UpgradeOutcome {
    let deadline = shared.options.websocket.handshake_timeout;

    let parsed = tokio::time::timeout(deadline, read_request(transport.input())).await;
    let (request, leftover) = match parsed {
        Err(_) => {
            debug!("handshake timed out");
            return UpgradeOutcome::Refused;
        }
        Ok(None) => return UpgradeOutcome::Refused,
        Ok(Some(Err(err))) => {
            debug!(%err, "malformed upgrade request");
            respond(transport, build_error_response(&err)).await;
            return UpgradeOutcome::Refused;
        }
        Ok(Some(Ok(parts))) => parts,
    };

    if let Err(err) = request.validate(&shared.options.websocket.allowed_origins) {
        debug!(%err, "upgrade validation failed");
        respond(transport, build_error_response(&err)).await;
        return UpgradeOutcome::Refused;
    }

    if !shared.events.connecting.is_empty() {
        let context = Arc::new(WsUpgradeContext::new(&request, transport.peer_addr()));
        shared.events.connecting.emit(context.clone()).await;
        if let Some((status, reason)) = context.rejection() {
            debug!(status, "upgrade rejected by authorization hook");
            respond(transport, build_reject_response(status, &reason)).await;
            return UpgradeOutcome::Refused;
        }
        // Unhandled contexts are auto-accepted.
    }

    let accept_key = compute_accept_key(request.key().unwrap_or_default());
    respond(transport, build_accept_response(&accept_key)).await;
    UpgradeOutcome::Upgraded { request, leftover }
}

/// Accumulate transport bytes until a full request head parses.
///
/// `None` means EOF before a complete request; `Some(Err)` a malformed
/// head.
async fn read_request(
    input: &PipeReader,
) -> Option<Result<(UpgradeRequest, BytesMut), UpgradeError>> {
    let mut acc = BytesMut::new();
    loop {
        match UpgradeRequest::parse(&mut acc) {
            Ok(Some(request)) => return Some(Ok((request, acc))),
            Ok(None) => {}
            Err(err) => return Some(Err(err)),
        }
        match input.read().await {
            Some(chunk) => acc.extend_from_slice(&chunk),
            None => return None,
        }
    }
}

async fn respond(transport: &Arc<Transport>, response: Vec<u8>) {
    if transport.output().write(Bytes::from(response)).is_ok() {
        let _ = transport.output().flush().await;
    }
}

async fn handle_connection(shared: Arc<ServerShared>, stream: TcpStream, peer: SocketAddr) {
    if let Err(err) = tune_stream(&stream, &shared.options.socket) {
        debug!(%peer, %err, "socket tuning failed");
    }

    let transport_options = TransportOptions {
        max_pending_receive_bytes: shared.options.max_pending_receive_bytes,
        max_pending_send_bytes: shared.options.max_pending_send_bytes,
    };
    let transport = Arc::new(match &shared.options.tls {
        Some(tls) => Transport::server_tls(stream, tls.acceptor(), transport_options),
        None => Transport::plain(stream, transport_options),
    });

    {
        let shared = shared.clone();
        transport.set_socket_error_hook(Arc::new(move |err| {
            let shared = shared.clone();
            tokio::spawn(async move {
                shared.events.socket_error.emit(Arc::new(err)).await;
            });
        }));
    }

    if let Err(err) = transport.handshake().await {
        debug!(%peer, %err, "transport handshake failed");
        transport.close().await;
        return;
    }

    let UpgradeOutcome::Upgraded { request, leftover } = run_upgrade(&shared, &transport).await
    else {
        transport.close().await;
        return;
    };

    let websocket = &shared.options.websocket;
    let session = Arc::new(WsSession::new(
        transport.clone(),
        Role::Server,
        websocket.max_frame_size,
        Some(peer),
        shared.options.slow_consumer_policy,
    ));
    session.core().advance_state(SessionState::Connected);

    if shared.options.slow_consumer_policy == SlowConsumerPolicy::Disconnect {
        let weak = Arc::downgrade(&session);
        session.set_backpressure_hook(Arc::new(move || {
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move { session.abort().await });
            }
        }));
    }

    if !shared.middleware.is_empty() {
        let weak = Arc::downgrade(&session);
        let middleware = shared.middleware.clone();
        session.set_send_filter(Arc::new(move |data| {
            let weak = weak.clone();
            let middleware = middleware.clone();
            async move {
                match weak.upgrade() {
                    Some(session) => middleware.data_sending(&session, data).await,
                    None => Some(data),
                }
            }
            .boxed()
        }));
    }

    if !shared.sessions.try_add(session.clone()) {
        warn!(session = %session.id(), "session id collision, dropping connection");
        transport.close().await;
        return;
    }

    if websocket.heartbeat.ping_interval > Duration::ZERO {
        let ping_weak = Arc::downgrade(&session);
        let timeout_weak = Arc::downgrade(&session);
        let heartbeat = Heartbeat::start(
            websocket.heartbeat.ping_interval,
            websocket.heartbeat.max_missed_pongs,
            move || {
                let weak = ping_weak.clone();
                async move {
                    if let Some(session) = weak.upgrade() {
                        let _ = session.ping(Bytes::new()).await;
                    }
                }
            },
            move || async move {
                // Spawned so the heartbeat task never joins itself
                // through the session's close path.
                if let Some(session) = timeout_weak.upgrade() {
                    debug!(session = %session.id(), "heartbeat timed out");
                    tokio::spawn(async move {
                        let _ = session.close().await;
                    });
                }
            },
        );
        session.attach_heartbeat(heartbeat);
    }

    debug!(session = %session.id(), %peer, path = %request.path, "websocket session connected");
    shared.middleware.connected(&session).await;
    shared.events.connected.emit(session.clone()).await;

    let loop_end = {
        let cb_shared = shared.clone();
        let cb_session = session.clone();
        run_frame_loop(
            &session,
            Role::Server,
            websocket.max_frame_size,
            leftover,
            &shared.shutdown,
            websocket.heartbeat.auto_pong,
            move |message| {
                let shared = cb_shared.clone();
                let session = cb_session.clone();
                async move {
                    if let Some(data) = shared
                        .middleware
                        .data_received(&session, message.data.clone())
                        .await
                    {
                        shared
                            .events
                            .message_received
                            .emit(WsMessageEvent {
                                session: session.clone(),
                                message: crate::session::WsMessage {
                                    data,
                                    is_text: message.is_text,
                                },
                            })
                            .await;
                    }
                }
            },
        )
        .await
    };

    match loop_end {
        LoopEnd::PeerClosed { status } => {
            let echo = close_status::sanitize(status.unwrap_or(close_status::NORMAL));
            let _ = session.close_with(echo).await;
        }
        LoopEnd::Protocol(err) => {
            let status = err.close_status();
            let error = SessionError::Io(err.into());
            shared.middleware.error(&session, &error).await;
            shared
                .events
                .error
                .emit(WsErrorEvent {
                    session: session.clone(),
                    error: Arc::new(error),
                })
                .await;
            let _ = session.close_with(status).await;
        }
        LoopEnd::Eof => session.abort().await,
        LoopEnd::Cancelled => {
            let _ = session.close_with(close_status::GOING_AWAY).await;
        }
    }

    session.core().advance_state(SessionState::Closed);
    shared.sessions.try_remove(session.id());
    shared.groups.remove_from_all(&session);
    shared.middleware.disconnected(&session).await;
    shared.events.disconnected.emit(session.clone()).await;
    debug!(session = %session.id(), "websocket session disconnected");
}
