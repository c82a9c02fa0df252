//! TCP client orchestrator: connect with timeout, framed read loop,
//! optional TLS, and auto-reconnect.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use storm_session::{
    EventHandlers, Session, SessionError, SessionState, SlowConsumerPolicy,
};
use storm_stream::{
    tune_stream, FramerFactory, PipeConnection, ReconnectAttempt, ReconnectOptions,
    SocketOptions, TlsClientOptions, Transport, TransportOptions,
};
use storm_wire::{Framer, RawFramer};

use crate::session::{TcpDataEvent, TcpErrorEvent, TcpSession};

/// TCP client configuration.
#[derive(Clone)]
pub struct TcpClientOptions {
    /// Target endpoint, `host:port`.
    pub endpoint: String,
    /// Deadline for resolve + connect + TLS handshake.
    pub connect_timeout: std::time::Duration,
    /// TLS settings; plaintext when absent.
    pub tls: Option<TlsClientOptions>,
    /// Framer factory; raw framing when absent.
    pub framer: Option<FramerFactory>,
    /// Socket tuning.
    pub socket: SocketOptions,
    /// Inbound pipe bound; zero disables.
    pub max_pending_receive_bytes: usize,
    /// Outbound pipe bound; zero disables.
    pub max_pending_send_bytes: usize,
    /// Slow-consumer policy for the client session.
    pub slow_consumer_policy: SlowConsumerPolicy,
    /// Auto-reconnect behavior.
    pub reconnect: ReconnectOptions,
}

impl TcpClientOptions {
    /// Defaults for the given target endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: std::time::Duration::from_secs(10),
            tls: None,
            framer: None,
            socket: SocketOptions::default(),
            max_pending_receive_bytes: 1024 * 1024,
            max_pending_send_bytes: 1024 * 1024,
            slow_consumer_policy: SlowConsumerPolicy::Wait,
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl fmt::Debug for TcpClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClientOptions")
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .field("tls", &self.tls.is_some())
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

/// Errors from establishing a client connection.
#[derive(Debug)]
pub enum ConnectError {
    /// The connect deadline elapsed.
    Timeout,
    /// Resolution, connection, or handshake failed.
    Io(io::Error),
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

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "connect timed out"),
            Self::Io(err) => write!(f, "connect failed: {err}"),
            Self::MaxAttemptsExceeded { attempts } => {
                write!(f, "reconnect gave up after {attempts} attempts")
            }
            Self::AlreadyStarted => write!(f, "client already connected"),
            Self::Cancelled => write!(f, "connect cancelled"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Subscriber lists for client lifecycle events.
#[derive(Debug, Default)]
pub struct TcpClientEvents {
    /// Connected (or reconnected) to the server.
    pub connected: EventHandlers<Arc<TcpSession>>,
    /// Connection ended.
    pub disconnected: EventHandlers<Arc<TcpSession>>,
    /// A framed message arrived.
    pub data_received: EventHandlers<TcpDataEvent>,
    /// An error surfaced on the connection.
    pub error: EventHandlers<TcpErrorEvent>,
    /// About to retry the connection.
    pub reconnecting: EventHandlers<ReconnectAttempt>,
}

struct ClientShared {
    options: TcpClientOptions,
    events: Arc<TcpClientEvents>,
    shutdown: CancellationToken,
    current: Mutex<Option<Arc<TcpSession>>>,
}

/// Raw TCP client.
pub struct TcpClient {
    options: TcpClientOptions,
    events: Arc<TcpClientEvents>,
    shared: Option<Arc<ClientShared>>,
    worker: Option<JoinHandle<()>>,
}

impl TcpClient {
    /// Client with the given options.
    #[must_use]
    pub fn new(options: TcpClientOptions) -> Self {
        Self {
            options,
            events: Arc::new(TcpClientEvents::default()),
            shared: None,
            worker: None,
        }
    }

    fn events_mut(&mut self) -> &mut TcpClientEvents {
        Arc::get_mut(&mut self.events).expect("event handlers must be registered before connect")
    }

    /// Subscribe to connects. Register before [`TcpClient::connect`].
    pub fn on_connected<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<TcpSession>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events_mut().connected.subscribe(handler);
    }

    /// Subscribe to disconnects.
    pub fn on_disconnected<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<TcpSession>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events_mut().disconnected.subscribe(handler);
    }

    /// Subscribe to inbound messages.
    pub fn on_data_received<F, Fut>(&mut self, handler: F)
    where
        F: Fn(TcpDataEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events_mut().data_received.subscribe(handler);
    }

    /// Subscribe to connection errors.
    pub fn on_error<F, Fut>(&mut self, handler: F)
    where
        F: Fn(TcpErrorEvent) -> Fut + Send + Sync + 'static,
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

    /// Connect to the configured endpoint.
    ///
    /// With reconnect enabled this resolves on the first successful
    /// connect, or fails once the attempt cap is exhausted; the
    /// supervisor keeps redialing in the background afterwards.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.shared.is_some() {
            return Err(ConnectError::AlreadyStarted);
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
                Err(_) => Err(ConnectError::Cancelled),
            }
        } else {
            let (session, connection) = establish(&shared).await?;
            self.worker = Some(tokio::spawn({
                let shared = shared.clone();
                async move {
                    run_session(&shared, session, connection).await;
                }
            }));
            self.shared = Some(shared);
            Ok(())
        }
    }

    /// The live session, when connected.
    #[must_use]
    pub fn session(&self) -> Option<Arc<TcpSession>> {
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

    /// Send a framed payload. Requires the Connected state.
    pub async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        let session = self.session().ok_or(SessionError::NotConnected)?;
        session.send(data).await
    }

    /// Close the connection and stop any reconnect supervisor.
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

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("endpoint", &self.options.endpoint)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Host portion of a `host:port` endpoint (brackets stripped for IPv6).
fn endpoint_host(endpoint: &str) -> &str {
    if let (Some(start), Some(end)) = (endpoint.find('['), endpoint.find(']')) {
        if start < end {
            return &endpoint[start + 1..end];
        }
    }
    match endpoint.rsplit_once(':') {
        Some((host, _)) => host,
        None => endpoint,
    }
}

async fn establish(
    shared: &Arc<ClientShared>,
) -> Result<(Arc<TcpSession>, Arc<PipeConnection>), ConnectError> {
    let options = &shared.options;

    let transport = tokio::time::timeout(options.connect_timeout, async {
        let addrs: Vec<_> = tokio::net::lookup_host(options.endpoint.as_str())
            .await
            .map_err(ConnectError::Io)?
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
            ConnectError::Io(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "endpoint resolved to no addresses")
            }))
        })?;

        if let Err(err) = tune_stream(&stream, &options.socket) {
            debug!(%err, "socket tuning failed");
        }

        let transport_options = TransportOptions {
            max_pending_receive_bytes: options.max_pending_receive_bytes,
            max_pending_send_bytes: options.max_pending_send_bytes,
        };
        let transport = Arc::new(match &options.tls {
            Some(tls) => {
                let name = tls
                    .server_name_for(endpoint_host(&options.endpoint))
                    .map_err(ConnectError::Io)?;
                Transport::client_tls(stream, tls.connector(), name, transport_options)
            }
            None => Transport::plain(stream, transport_options),
        });
        transport.handshake().await.map_err(ConnectError::Io)?;
        Ok::<_, ConnectError>(transport)
    })
    .await
    .map_err(|_| ConnectError::Timeout)??;

    let framer: Box<dyn Framer> = match &shared.options.framer {
        Some(factory) => factory(),
        None => Box::new(RawFramer),
    };
    let connection = Arc::new(PipeConnection::new(transport, framer));
    let session = Arc::new(TcpSession::new(
        connection.clone(),
        connection.transport().peer_addr(),
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

    *shared.current.lock().unwrap() = Some(session.clone());
    Ok((session, connection))
}

async fn run_session(
    shared: &Arc<ClientShared>,
    session: Arc<TcpSession>,
    connection: Arc<PipeConnection>,
) {
    shared.events.connected.emit(session.clone()).await;

    let run_result = {
        let cb_events = shared.events.clone();
        let cb_session = session.clone();
        connection
            .run(&shared.shutdown, move |data| {
                let events = cb_events.clone();
                let session = cb_session.clone();
                async move {
                    session.core().metrics().add_received(data.len() as u64);
                    events
                        .data_received
                        .emit(TcpDataEvent {
                            session: session.clone(),
                            data,
                        })
                        .await;
                }
            })
            .await
    };

    if let Err(err) = run_result {
        let error = Arc::new(SessionError::Io(err));
        shared
            .events
            .error
            .emit(TcpErrorEvent {
                session: session.clone(),
                error,
            })
            .await;
    }

    session.core().advance_state(SessionState::Closing);
    connection.transport().close().await;
    session.core().advance_state(SessionState::Closed);
    *shared.current.lock().unwrap() = None;
    shared.events.disconnected.emit(session).await;
}

async fn supervise(shared: Arc<ClientShared>, first: oneshot::Sender<Result<(), ConnectError>>) {
    let mut first = Some(first);
    let mut attempt: u32 = 0;

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        match establish(&shared).await {
            Ok((session, connection)) => {
                attempt = 0;
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
                run_session(&shared, session, connection).await;
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
                let _ = tx.send(Err(ConnectError::MaxAttemptsExceeded {
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
