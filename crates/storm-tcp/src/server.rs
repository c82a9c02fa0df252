//! TCP server orchestrator: listen, accept, session lifecycle, broadcast,
//! shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
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
    bind_listener, tune_stream, FramerFactory, ListenerConfig, PipeConnection, SocketOptions,
    TlsServerOptions, Transport, TransportOptions,
};
use storm_wire::{Framer, RawFramer};

use crate::session::{TcpDataEvent, TcpErrorEvent, TcpSession};

/// TCP server configuration.
#[derive(Clone)]
pub struct TcpServerOptions {
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
    /// Framer factory; raw framing when absent.
    pub framer: Option<FramerFactory>,
    /// Per-connection socket tuning.
    pub socket: SocketOptions,
}

impl TcpServerOptions {
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
            framer: None,
            socket: SocketOptions::default(),
        }
    }
}

impl std::fmt::Debug for TcpServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServerOptions")
            .field("endpoint", &self.endpoint)
            .field("max_connections", &self.max_connections)
            .field("slow_consumer_policy", &self.slow_consumer_policy)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// Subscriber lists for server lifecycle events.
#[derive(Debug, Default)]
pub struct TcpServerEvents {
    /// A session finished its handshake and is registered.
    pub connected: EventHandlers<Arc<TcpSession>>,
    /// A session was torn down and removed.
    pub disconnected: EventHandlers<Arc<TcpSession>>,
    /// A framed message arrived (after middleware).
    pub data_received: EventHandlers<TcpDataEvent>,
    /// An error surfaced on a session's connection.
    pub error: EventHandlers<TcpErrorEvent>,
    /// A socket error that is not an expected disconnect.
    pub socket_error: EventHandlers<Arc<io::Error>>,
}

struct ServerShared {
    options: TcpServerOptions,
    events: TcpServerEvents,
    middleware: MiddlewarePipeline<TcpSession>,
    sessions: SessionManager<TcpSession>,
    groups: SessionGroup<TcpSession>,
    shutdown: CancellationToken,
}

/// Raw TCP server.
///
/// Configure, subscribe handlers and middleware, then [`TcpServer::start`].
/// Each accepted socket runs on its own task; one session's suspension
/// never blocks another.
pub struct TcpServer {
    options: TcpServerOptions,
    events: TcpServerEvents,
    middleware: MiddlewarePipeline<TcpSession>,
    shared: Option<Arc<ServerShared>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpServer {
    /// Server with the given options.
    #[must_use]
    pub fn new(options: TcpServerOptions) -> Self {
        Self {
            options,
            events: TcpServerEvents::default(),
            middleware: MiddlewarePipeline::new(),
            shared: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Subscribe to session connects.
    pub fn on_connected<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<TcpSession>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.connected.subscribe(handler);
    }

    /// Subscribe to session disconnects.
    pub fn on_disconnected<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<TcpSession>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.disconnected.subscribe(handler);
    }

    /// Subscribe to inbound messages.
    pub fn on_data_received<F, Fut>(&mut self, handler: F)
    where
        F: Fn(TcpDataEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events.data_received.subscribe(handler);
    }

    /// Subscribe to session errors.
    pub fn on_error<F, Fut>(&mut self, handler: F)
    where
        F: Fn(TcpErrorEvent) -> Fut + Send + Sync + 'static,
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
    pub fn use_middleware<M: Middleware<TcpSession> + 'static>(&mut self, stage: M) {
        self.middleware = std::mem::take(&mut self.middleware).with(stage);
    }

    /// Bind and start accepting.
    pub async fn start(&mut self) -> io::Result<()> {
        self.start_with(CancellationToken::new()).await
    }

    /// Bind and start accepting; `cancel` stops the server like
    /// [`TcpServer::stop`] does.
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

        info!(%local_addr, "tcp server listening");
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
    pub fn sessions(&self) -> Option<&SessionManager<TcpSession>> {
        self.shared.as_ref().map(|shared| &shared.sessions)
    }

    /// The group registry, once started.
    #[must_use]
    pub fn groups(&self) -> Option<&SessionGroup<TcpSession>> {
        self.shared.as_ref().map(|shared| &shared.groups)
    }

    /// Send `data` to every session except `exclude`.
    pub async fn broadcast(&self, data: Bytes, exclude: Option<SessionId>) {
        if let Some(shared) = &self.shared {
            shared.sessions.broadcast(data, exclude).await;
        }
    }

    /// Stop accepting and close every session.
    pub async fn stop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        shared.sessions.close_all().await;
        self.local_addr = None;
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
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
                // Transient resource exhaustion (for example EMFILE)
                // would otherwise spin this loop.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("accept loop stopped");
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

    let framer: Box<dyn Framer> = match &shared.options.framer {
        Some(factory) => factory(),
        None => Box::new(RawFramer),
    };
    let connection = Arc::new(PipeConnection::new(transport.clone(), framer));
    let session = Arc::new(TcpSession::new(
        connection.clone(),
        Some(peer),
        shared.options.slow_consumer_policy,
    ));
    session.core().advance_state(SessionState::Connected);

    if shared.options.slow_consumer_policy == SlowConsumerPolicy::Disconnect {
        let weak = Arc::downgrade(&session);
        connection.set_backpressure_hook(Arc::new(move || {
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

    debug!(session = %session.id(), %peer, "session connected");
    shared.middleware.connected(&session).await;
    shared.events.connected.emit(session.clone()).await;

    let run_result = {
        let cb_shared = shared.clone();
        let cb_session = session.clone();
        connection
            .run(&shared.shutdown, move |data| {
                let shared = cb_shared.clone();
                let session = cb_session.clone();
                async move {
                    session.core().metrics().add_received(data.len() as u64);
                    if let Some(data) = shared.middleware.data_received(&session, data).await {
                        shared
                            .events
                            .data_received
                            .emit(TcpDataEvent {
                                session: session.clone(),
                                data,
                            })
                            .await;
                    }
                }
            })
            .await
    };

    if let Err(err) = run_result {
        let error = SessionError::Io(err);
        shared.middleware.error(&session, &error).await;
        shared
            .events
            .error
            .emit(TcpErrorEvent {
                session: session.clone(),
                error: Arc::new(error),
            })
            .await;
    }

    session.core().advance_state(SessionState::Closing);
    transport.close().await;
    session.core().advance_state(SessionState::Closed);
    shared.sessions.try_remove(session.id());
    shared.groups.remove_from_all(&session);
    shared.middleware.disconnected(&session).await;
    shared.events.disconnected.emit(session.clone()).await;
    debug!(session = %session.id(), "session disconnected");
}
