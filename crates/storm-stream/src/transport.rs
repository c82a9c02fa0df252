//! Socket-facing transport with decoupled pump loops.
//!
//! A [`Transport`] owns one socket (plaintext or TLS) and, once
//! [`Transport::handshake`] has run, two background tasks:
//!
//! - the inbound pump reads from the socket into the inbound pipe and
//!   stops reading while that pipe is saturated (kernel backpressure);
//! - the outbound pump drains the outbound pipe into the socket.
//!
//! Sessions never touch the socket; they read from [`Transport::input`]
//! and write through [`Transport::output`].

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::pipe::{pipe, PipeReader, PipeWriter};

/// Read size of the inbound pump.
const READ_CHUNK: usize = 8 * 1024;

/// How long `close` waits for the pumps before aborting them.
const PUMP_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Hook invoked for socket errors that are not expected disconnects.
pub type SocketErrorHook = std::sync::Arc<dyn Fn(io::Error) + Send + Sync>;

/// Whether a socket error indicates a normal or expected disconnect that
/// should terminate the loop quietly.
#[must_use]
pub fn is_quiet_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Any bidirectional byte stream a transport can drive: real sockets,
/// TLS wrappers, or in-memory pairs from [`tokio::io::duplex`].
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Byte stream that is either plaintext, TLS-wrapped, or an arbitrary
/// boxed stream.
///
/// After the handshake all variants behave identically; nothing above
/// this enum knows whether encryption (or a socket at all) is in place.
pub enum MaybeTlsStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// Server-side TLS.
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Client-side TLS.
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// Any other byte stream (in-memory pairs, pre-wrapped TLS).
    Boxed(Box<dyn ByteStream>),
}

impl std::fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Plain(_) => "Plain",
            Self::ServerTls(_) => "ServerTls",
            Self::ClientTls(_) => "ClientTls",
            Self::Boxed(_) => "Boxed",
        };
        f.debug_tuple(name).finish()
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Self::Boxed(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Self::Boxed(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Self::Boxed(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Self::Boxed(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Bounds on the in-memory pipes of a [`Transport`].
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Pause threshold of the inbound pipe; zero disables the bound.
    pub max_pending_receive_bytes: usize,
    /// Pause threshold of the outbound pipe; zero disables the bound.
    pub max_pending_send_bytes: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_pending_receive_bytes: 1024 * 1024,
            max_pending_send_bytes: 1024 * 1024,
        }
    }
}

enum PendingStream {
    Plain(TcpStream),
    ServerTls {
        stream: TcpStream,
        acceptor: TlsAcceptor,
    },
    ClientTls {
        stream: TcpStream,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    Boxed(Box<dyn ByteStream>),
}

/// Bidirectional byte stream with bounded buffers over one socket.
pub struct Transport {
    input: PipeReader,
    inbound_writer: PipeWriter,
    output: PipeWriter,
    outbound_reader: PipeReader,
    pending: Mutex<Option<PendingStream>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    on_socket_error: Mutex<Option<SocketErrorHook>>,
    peer_addr: Option<SocketAddr>,
}

impl Transport {
    /// Transport over a plaintext socket.
    #[must_use]
    pub fn plain(stream: TcpStream, options: TransportOptions) -> Self {
        Self::new(PendingStream::Plain(stream), options)
    }

    /// Transport that performs a server-side TLS handshake in
    /// [`Transport::handshake`].
    #[must_use]
    pub fn server_tls(stream: TcpStream, acceptor: TlsAcceptor, options: TransportOptions) -> Self {
        Self::new(PendingStream::ServerTls { stream, acceptor }, options)
    }

    /// Transport that performs a client-side TLS handshake in
    /// [`Transport::handshake`].
    #[must_use]
    pub fn client_tls(
        stream: TcpStream,
        connector: TlsConnector,
        server_name: ServerName<'static>,
        options: TransportOptions,
    ) -> Self {
        Self::new(
            PendingStream::ClientTls {
                stream,
                connector,
                server_name,
            },
            options,
        )
    }

    /// Transport over an arbitrary byte stream: in-memory pairs from
    /// [`tokio::io::duplex`], pre-wrapped TLS, anything that reads and
    /// writes bytes. [`Transport::handshake`] performs no negotiation for
    /// this variant and [`Transport::peer_addr`] is `None`.
    #[must_use]
    pub fn from_stream(stream: impl ByteStream + 'static, options: TransportOptions) -> Self {
        Self::new(PendingStream::Boxed(Box::new(stream)), options)
    }

    fn new(pending: PendingStream, options: TransportOptions) -> Self {
        let peer_addr = match &pending {
            PendingStream::Plain(s)
            | PendingStream::ServerTls { stream: s, .. }
            | PendingStream::ClientTls { stream: s, .. } => s.peer_addr().ok(),
            PendingStream::Boxed(_) => None,
        };

        let (inbound_writer, input) = pipe(options.max_pending_receive_bytes);
        let (output, outbound_reader) = pipe(options.max_pending_send_bytes);
        Self {
            input,
            inbound_writer,
            output,
            outbound_reader,
            pending: Mutex::new(Some(pending)),
            pumps: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            on_socket_error: Mutex::new(None),
            peer_addr,
        }
    }

    /// Remote address of the underlying socket, when known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Install the hook for unexpected socket errors. Must be set before
    /// [`Transport::handshake`]; later changes are not picked up by
    /// running pumps.
    pub fn set_socket_error_hook(&self, hook: SocketErrorHook) {
        *self.on_socket_error.lock().unwrap() = Some(hook);
    }

    /// Negotiate TLS if configured and start the pump loops.
    ///
    /// Idempotent: completed handshakes make later calls no-ops.
    pub async fn handshake(&self) -> io::Result<()> {
        let Some(pending) = self.pending.lock().unwrap().take() else {
            return Ok(());
        };

        let stream = match pending {
            PendingStream::Plain(stream) => MaybeTlsStream::Plain(stream),
            PendingStream::ServerTls { stream, acceptor } => {
                MaybeTlsStream::ServerTls(Box::new(acceptor.accept(stream).await?))
            }
            PendingStream::ClientTls {
                stream,
                connector,
                server_name,
            } => MaybeTlsStream::ClientTls(Box::new(
                connector.connect(server_name, stream).await?,
            )),
            PendingStream::Boxed(stream) => MaybeTlsStream::Boxed(stream),
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let hook = self.on_socket_error.lock().unwrap().clone();

        let inbound = tokio::spawn(inbound_pump(
            read_half,
            self.inbound_writer.clone(),
            self.shutdown.clone(),
            hook.clone(),
        ));
        let outbound = tokio::spawn(outbound_pump(
            write_half,
            self.outbound_reader.clone(),
            self.shutdown.clone(),
            hook,
        ));
        *self.pumps.lock().unwrap() = vec![inbound, outbound];
        Ok(())
    }

    /// Inbound byte source. EOF (`None`) after the peer closed or the
    /// transport shut down.
    #[must_use]
    pub fn input(&self) -> &PipeReader {
        &self.input
    }

    /// Outbound byte sink; `flush` applies backpressure.
    #[must_use]
    pub fn output(&self) -> &PipeWriter {
        &self.output
    }

    /// Whether [`Transport::close`] has begun.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Gracefully shut both directions down.
    ///
    /// Buffered outbound bytes are given to the socket first, then the
    /// pumps are stopped and joined and the socket is closed. Safe to call
    /// concurrently and repeatedly.
    pub async fn close(&self) {
        // EOF the outbound pipe so the pump drains what is buffered.
        self.output.close();
        self.shutdown.cancel();
        self.input.close();

        let pumps = std::mem::take(&mut *self.pumps.lock().unwrap());
        for pump in pumps {
            let aborter = pump.abort_handle();
            if tokio::time::timeout(PUMP_JOIN_GRACE, pump).await.is_err() {
                debug!("transport pump did not stop in time, aborting");
                aborter.abort();
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer_addr", &self.peer_addr)
            .field("closing", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn report(hook: &Option<SocketErrorHook>, direction: &str, err: io::Error) {
    if is_quiet_disconnect(&err) {
        trace!(%err, direction, "socket disconnected");
        return;
    }
    debug!(%err, direction, "socket error");
    if let Some(hook) = hook {
        hook(err);
    }
}

async fn inbound_pump(
    mut read_half: ReadHalf<MaybeTlsStream>,
    writer: PipeWriter,
    shutdown: CancellationToken,
    hook: Option<SocketErrorHook>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = read_half.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                report(&hook, "read", err);
                break;
            }
        };
        if writer.write(Bytes::copy_from_slice(&buf[..n])).is_err() {
            break;
        }
        // A saturated inbound pipe suspends us here, which stops the
        // socket reads until the consumer catches up.
        let flushed = tokio::select! {
            () = shutdown.cancelled() => break,
            flushed = writer.flush() => flushed,
        };
        if flushed.is_err() {
            break;
        }
    }
    writer.close();
}

async fn outbound_pump(
    mut write_half: WriteHalf<MaybeTlsStream>,
    reader: PipeReader,
    shutdown: CancellationToken,
    hook: Option<SocketErrorHook>,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            chunk = reader.read() => chunk,
            () = shutdown.cancelled() => break,
        };
        let Some(chunk) = chunk else { break };
        if let Err(err) = write_half.write_all(&chunk).await {
            report(&hook, "write", err);
            // Unblock producers stuck in flush.
            reader.close();
            break;
        }
        if let Err(err) = write_half.flush().await {
            report(&hook, "write", err);
            reader.close();
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_disconnect_classification() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
        ] {
            assert!(is_quiet_disconnect(&io::Error::new(kind, "x")), "{kind:?}");
        }
        assert!(!is_quiet_disconnect(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "x"
        )));
        assert!(!is_quiet_disconnect(&io::Error::new(
            io::ErrorKind::InvalidData,
            "x"
        )));
    }

    #[tokio::test]
    async fn duplex_transport_roundtrip() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let transport = std::sync::Arc::new(Transport::from_stream(
            local,
            TransportOptions::default(),
        ));
        transport.handshake().await.unwrap();
        assert!(transport.peer_addr().is_none());

        // Echo until the peer hangs up.
        let echo = tokio::spawn({
            let transport = transport.clone();
            async move {
                while let Some(chunk) = transport.input().read().await {
                    transport.output().write(chunk).unwrap();
                    transport.output().flush().await.unwrap();
                }
                transport.close().await;
            }
        });

        remote.write_all(b"ping over the transport").await.unwrap();
        let mut echoed = vec![0u8; 23];
        remote.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed[..], b"ping over the transport");

        remote.shutdown().await.unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_is_idempotent() {
        let (local, _remote) = tokio::io::duplex(1024);
        let transport = Transport::from_stream(local, TransportOptions::default());
        transport.handshake().await.unwrap();
        transport.handshake().await.unwrap();
        assert_eq!(transport.pumps.lock().unwrap().len(), 2);
        transport.close().await;
    }

    #[tokio::test]
    async fn input_reports_eof_when_peer_goes_away() {
        let (local, remote) = tokio::io::duplex(1024);
        let transport = Transport::from_stream(local, TransportOptions::default());
        transport.handshake().await.unwrap();

        drop(remote);
        assert!(transport.input().read().await.is_none());
        transport.close().await;
    }
}
