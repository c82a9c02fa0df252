//! WebSocket client orchestrator: connect, upgrade, frame loop,
//! heartbeat, and auto-reconnect.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use storm_session::{EventHandlers, Session, SessionError, SessionState, SlowConsumerPolicy};
use storm_stream::{
    tune_stream, ReconnectAttempt, ReconnectOptions, SocketOptions, TlsClientOptions, Transport,
    TransportOptions,
};
use storm_wire::{
    close_status, ClientUpgrade, Role, UpgradeError, UpgradeResponse, WsUrl,
};

use crate::heartbeat::{Heartbeat, HeartbeatOptions};
use crate::session::{run_frame_loop, LoopEnd, WsErrorEvent, WsMessageEvent, WsSession};

/// WebSocket client configuration.
#[derive(Clone)]
pub struct WsClientOptions {
    /// Target URL (`ws://` or `wss://`).
    pub url: String,
    /// Deadline for resolve + connect + TLS + upgrade.
    pub connect_timeout: Duration,
    /// Maximum accepted frame (and reassembled message) payload.
    pub max_frame_size: usize,
    /// Extra headers appended to the upgrade request.
    pub extra_headers: Vec<(String, String)>,
    /// TLS settings; required for `wss://` URLs.
    pub tls: Option<TlsClientOptions>,
    /// Socket tuning.
    pub socket: SocketOptions,
    /// Ping cadence and tolerance; interval zero disables.
    pub heartbeat: HeartbeatOptions,
    /// Auto-reconnect behavior.
    pub reconnect: ReconnectOptions,
    /// Inbound pipe bound; zero disables.
    pub max_pending_receive_bytes: usize,
    /// Outbound pipe bound; zero disables.
    pub max_pending_send_bytes: usize,
    /// Slow-consumer policy for the client session.
    pub slow_consumer_policy: SlowConsumerPolicy,
}

impl WsClientOptions {
    /// Defaults for the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            max_frame_size: 1024 * 1024,
            extra_headers: Vec::new(),
            tls: None,
            socket: SocketOptions::default(),
            heartbeat: HeartbeatOptions::default(),
            reconnect: ReconnectOptions::default(),
            max_pending_receive_bytes: 1024 * 1024,
            max_pending_send_bytes: 1024 * 1024,
            slow_consumer_policy: SlowConsumerPolicy::Wait,
        }
    }
}

impl fmt::Debug for WsClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClientOptions")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

/// Errors from establishing a WebSocket connection.
#[derive(Debug)]
pub enum WsConnectError {
    /// The connect deadline elapsed.
    Timeout,
    /// Resolution, connection, or TLS failed.
    Io(io::Error),
    /// The URL or the upgrade exchange was invalid.
    Upgrade(UpgradeError),
    /// Auto-reconnect gave up after the configured attempt cap.
    MaxAttemptsExceeded {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// `connect` was called twice without a `disconnect` in between.
    AlreadyStarted,
    /// The client was cancelled before the first connect completed.
    Cancelled,
}

impl fmt::Display for WsConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "connect timed out"),
            Self::Io(err) => write!(f, "connect failed: {err}"),
            Self::Upgrade(err) => write!(f, "upgrade failed: {err}"),
            Self::MaxAttemptsExceeded { attempts } => {
                write!(f, "reconnect gave up after {attempts} attempts")
            }
            Self::AlreadyStarted => write!(f, "client already connected"),
            Self::Cancelled => write!(f, "connect cancelled"),
        }
    }
}

impl std::error::Error for WsConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Upgrade(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WsConnectError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<UpgradeError> for WsConnectError {
    fn from(err: UpgradeError) -> Self {
        Self::Upgrade(err)
    }
}

/// Subscriber lists for client lifecycle events.
#[derive(Debug, Default)]
pub struct WsClientEvents {
    /// Connected (or reconnected) to the server.
    pub connected: EventHandlers<Arc<WsSession>>,
    /// Connection ended.
    pub disconnected: EventHandlers<Arc<WsSession>>,
    /// A data message arrived.
    pub message_received: EventHandlers<WsMessageEvent>,
    /// An error surfaced on the connection.
    pub error: EventHandlers<WsErrorEvent>,
    /// About to retry the connection.
    pub reconnecting: EventHandlers<ReconnectAttempt>,
}

struct ClientShared {
    options: WsClientOptions,
    events: Arc<WsClientEvents>,
    shutdown: CancellationToken,
    current: Mutex<Option<Arc<WsSession>>>,
}

/// RFC 6455 WebSocket client.
pub struct WsClient {
    options: WsClientOptions,
    events: Arc<WsClientEvents>,
    shared: Option<Arc<ClientShared>>,
    worker: Option<JoinHandle<()>>,
}

impl WsClient {
    /// Client with the given options.
    #[must_use]
    pub fn new(options: WsClientOptions) -> Self {
        Self {
            options,
            events: Arc::new(WsClientEvents::default()),
            shared: None,
            worker: None,
        }
    }

    fn events_mut(&mut self) -> &mut WsClientEvents {
        Arc::get_mut(&mut self.events).expect("event handlers must be registered before connect")
    }

    /// Subscribe to connects. Register before [`WsClient::connect`].
    pub fn on_connected<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<WsSession>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events_mut().connected.subscribe(handler);
    }

    /// Subscribe to disconnects.
    pub fn on_disconnected<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<WsSession>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events_mut().disconnected.subscribe(handler);
    }

    /// Subscribe to inbound messages.
    pub fn on_message_received<F, Fut>(&mut self, handler: F)
    where
        F: Fn(WsMessageEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events_mut().message_received.subscribe(handler);
    }

    /// Subscribe to connection errors.
    pub fn on_error<F, Fut>(&mut self, handler: F)
    where
        F: Fn(WsErrorEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events_mut().error.subscribe(handler);
    }

    /// Subscribe to reconnection attempts.
    pub fn on_reconnecting<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ReconnectAttempt) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events_mut().reconnecting.subscribe(handler);
    }

    /// Connect and complete the upgrade.
    ///
    /// With reconnect enabled this resolves on the first successful
    /// connect or once the attempt cap is exhausted; the supervisor
    /// keeps redialing in the background afterwards.
    pub async fn connect(&mut self) -> Result<(), WsConnectError> {
        if self.shared.is_some() {
            return Err(WsConnectError::AlreadyStarted);
        }

        let shared = Arc::new(ClientShared {
            options: self.options.clone(),
            events: self.events.clone(),
            shutdown: CancellationToken::new(),
            current: Mutex::new(None),
        });

        if shared.options.reconnect.enabled {
            let (first_tx, first_rx) = oneshot::channel();
            self.worker = Some(tokio::spawn(supervise(shared.clone(), first_tx)));
            self.shared = Some(shared);
            match first_rx.await {
                Ok(result) => result,
                Err(_) => Err(WsConnectError::Cancelled),
            }
        } else {
            let (session, leftover) = establish(&shared).await?;
            self.worker = Some(tokio::spawn({
                let shared = shared.clone();
                async move {
                    run_session(&shared, session, leftover).await;
                }
            }));
            self.shared = Some(shared);
            Ok(())
        }
    }

    /// The live session, when connected.
    #[must_use]
    pub fn session(&self) -> Option<Arc<WsSession>> {
        self.shared
            .as_ref()
            .and_then(|shared| shared.current.lock().unwrap().clone())
    }

    /// Whether a session is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session()
            .map(|session| session.state() == SessionState::Connected)
            .unwrap_or(false)
    }

    /// Send a text frame. Requires the Connected state.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let session = self.session().ok_or(SessionError::NotConnected)?;
        session.send_text(text).await
    }

    /// Send a binary frame. Requires the Connected state.
    pub async fn send_binary(&self, data: Bytes) -> Result<(), SessionError> {
        let session = self.session().ok_or(SessionError::NotConnected)?;
        session.send_binary(data).await
    }

    /// Close the connection (Close 1000) and stop any reconnect
    /// supervisor.
    pub async fn disconnect(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.shutdown.cancel();
        let session = shared.current.lock().unwrap().clone();
        if let Some(session) = session {
            let _ = session.close().await;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl fmt::Debug for WsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.options.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

async fn establish(
    shared: &Arc<ClientShared>,
) -> Result<(Arc<WsSession>, BytesMut), WsConnectError> {
    let options = &shared.options;
    let url = WsUrl::parse(&options.url)?;

    let (transport, leftover) = tokio::time::timeout(options.connect_timeout, async {
        let addrs: Vec<_> =
            tokio::net::lookup_host((url.host.as_str(), url.port))
                .await
                .map_err(WsConnectError::Io)?
                .collect();

        let mut last_err = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let stream = connected.ok_or_else(|| {
            WsConnectError::Io(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "URL resolved to no addresses")
            }))
        })?;

        if let Err(err) = tune_stream(&stream, &options.socket) {
            debug!(%err, "socket tuning failed");
        }

        let transport_options = TransportOptions {
            max_pending_receive_bytes: options.max_pending_receive_bytes,
            max_pending_send_bytes: options.max_pending_send_bytes,
        };
        let transport = Arc::new(if url.tls || options.tls.is_some() {
            let tls = options.tls.clone().ok_or_else(|| {
                WsConnectError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "wss URL requires TLS configuration",
                ))
            })?;
            let name = tls.server_name_for(&url.host).map_err(WsConnectError::Io)?;
            Transport::client_tls(stream, tls.connector(), name, transport_options)
        } else {
            Transport::plain(stream, transport_options)
        });
        transport.handshake().await.map_err(WsConnectError::Io)?;

        // Upgrade round-trip.
        let upgrade =
            ClientUpgrade::new(url.clone()).extra_headers(options.extra_headers.clone());
        transport
            .output()
            .write(Bytes::from(upgrade.request_bytes()))
            .map_err(WsConnectError::Io)?;
        transport
            .output()
            .flush()
            .await
            .map_err(WsConnectError::Io)?;

        let mut acc = BytesMut::new();
        let response = loop {
            if let Some(response) = UpgradeResponse::parse(&mut acc)? {
                break response;
            }
            match transport.input().read().await {
                Some(chunk) => acc.extend_from_slice(&chunk),
                None => {
                    return Err(WsConnectError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during upgrade",
                    )))
                }
            }
        };
        upgrade.validate_response(&response)?;
        Ok::<_, WsConnectError>((transport, acc))
    })
    .await
    .map_err(|_| WsConnectError::Timeout)??;

    let session = Arc::new(WsSession::new(
        transport.clone(),
        Role::Client,
        options.max_frame_size,
        transport.peer_addr(),
        options.slow_consumer_policy,
    ));
    session.core().advance_state(SessionState::Connected);

    if options.slow_consumer_policy == SlowConsumerPolicy::Disconnect {
        let weak = Arc::downgrade(&session);
        session.set_backpressure_hook(Arc::new(move || {
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move { session.abort().await });
            }
        }));
    }

    if options.heartbeat.ping_interval > Duration::ZERO {
        let ping_weak = Arc::downgrade(&session);
        let timeout_weak = Arc::downgrade(&session);
        let heartbeat = Heartbeat::start(
            options.heartbeat.ping_interval,
            options.heartbeat.max_missed_pongs,
            move || {
                let weak = ping_weak.clone();
                async move {
                    if let Some(session) = weak.upgrade() {
                        let _ = session.ping(Bytes::new()).await;
                    }
                }
            },
            move || async move {
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

    *shared.current.lock().unwrap() = Some(session.clone());
    Ok((session, leftover))
}

async fn run_session(shared: &Arc<ClientShared>, session: Arc<WsSession>, leftover: BytesMut) {
    shared.events.connected.emit(session.clone()).await;

    let loop_end = {
        let cb_events = shared.events.clone();
        let cb_session = session.clone();
        run_frame_loop(
            &session,
            Role::Client,
            shared.options.max_frame_size,
            leftover,
            &shared.shutdown,
            shared.options.heartbeat.auto_pong,
            move |message| {
                let events = cb_events.clone();
                let session = cb_session.clone();
                async move {
                    events
                        .message_received
                        .emit(WsMessageEvent { session, message })
                        .await;
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
            let error = Arc::new(SessionError::Io(err.into()));
            shared
                .events
                .error
                .emit(WsErrorEvent {
                    session: session.clone(),
                    error,
                })
                .await;
            let _ = session.close_with(status).await;
        }
        LoopEnd::Eof => session.abort().await,
        LoopEnd::Cancelled => {
            let _ = session.close().await;
        }
    }

    session.core().advance_state(SessionState::Closed);
    *shared.current.lock().unwrap() = None;
    shared.events.disconnected.emit(session).await;
}

async fn supervise(
    shared: Arc<ClientShared>,
    first: oneshot::Sender<Result<(), WsConnectError>>,
) {
    let mut first = Some(first);
    let mut attempt: u32 = 0;

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        match establish(&shared).await {
            Ok((session, leftover)) => {
                attempt = 0;
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
                run_session(&shared, session, leftover).await;
            }
            Err(err) => {
                debug!(%err, "connect attempt failed");
            }
        }

        if shared.shutdown.is_cancelled() {
            break;
        }

        attempt += 1;
        let reconnect = shared.options.reconnect;
        if reconnect.max_attempts > 0 && attempt > reconnect.max_attempts {
            if let Some(tx) = first.take() {
                let _ = tx.send(Err(WsConnectError::MaxAttemptsExceeded {
                    attempts: reconnect.max_attempts,
                }));
            }
            break;
        }

        shared
            .events
            .reconnecting
            .emit(ReconnectAttempt {
                attempt,
                delay: reconnect.delay,
            })
            .await;
        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            () = tokio::time::sleep(reconnect.delay) => {}
        }
    }
}
