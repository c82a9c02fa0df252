//! Framed connection over a [`Transport`].
//!
//! [`PipeConnection`] drives the inbound half of a raw TCP session: it
//! feeds transport bytes through a [`Framer`] and hands complete messages
//! to a callback, strictly in arrival order. The outbound half frames a
//! payload, hands it to the transport, and observes backpressure while
//! the flush drains.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use storm_wire::Framer;

use crate::transport::Transport;

/// Hook fired once per connection the first time backpressure is
/// observed in the write path.
pub type BackpressureHook = Arc<dyn Fn() + Send + Sync>;

/// Factory producing one framer per connection, used by server and
/// client options. Defaults to [`RawFramer`](storm_wire::RawFramer) when
/// absent.
pub type FramerFactory = Arc<dyn Fn() -> Box<dyn Framer> + Send + Sync>;

/// A transport plus a framing discipline.
pub struct PipeConnection {
    transport: Arc<Transport>,
    framer: Mutex<Box<dyn Framer>>,
    backpressured: AtomicBool,
    backpressure_reported: AtomicBool,
    on_backpressure: Mutex<Option<BackpressureHook>>,
}

impl PipeConnection {
    /// Wrap a transport with the given framer.
    #[must_use]
    pub fn new(transport: Arc<Transport>, framer: Box<dyn Framer>) -> Self {
        Self {
            transport,
            framer: Mutex::new(framer),
            backpressured: AtomicBool::new(false),
            backpressure_reported: AtomicBool::new(false),
            on_backpressure: Mutex::new(None),
        }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// True while an outbound flush is suspended waiting for drain.
    #[must_use]
    pub fn is_backpressured(&self) -> bool {
        self.backpressured.load(Ordering::Acquire)
    }

    /// Install the once-only backpressure hook (used to apply the
    /// Disconnect slow-consumer policy as soon as pressure appears).
    pub fn set_backpressure_hook(&self, hook: BackpressureHook) {
        *self.on_backpressure.lock().unwrap() = Some(hook);
    }

    /// Drive the inbound message loop until EOF, cancellation, or a
    /// framing error.
    ///
    /// Messages are dispatched one at a time and in arrival order; the
    /// next read happens only after the callback's future completes.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut on_message: F,
    ) -> io::Result<()>
    where
        F: FnMut(Bytes) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut acc = BytesMut::new();
        loop {
            loop {
                // The framer lock is not held across the dispatch await.
                let decoded = self.framer.lock().unwrap().decode(&mut acc)?;
                match decoded {
                    Some(message) => on_message(message).await,
                    None => break,
                }
            }

            let chunk = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                chunk = self.transport.input().read() => chunk,
            };
            match chunk {
                Some(chunk) => acc.extend_from_slice(&chunk),
                None => return Ok(()),
            }
        }
    }

    /// Frame `payload` and send it, waiting out any backpressure.
    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut framed = BytesMut::with_capacity(payload.len() + 8);
        self.framer.lock().unwrap().encode(payload, &mut framed)?;
        self.write_and_flush(framed.freeze()).await
    }

    /// Hand pre-framed bytes to the transport and flush.
    ///
    /// The backpressure flag is set for the duration of a suspended flush
    /// and cleared whether or not the flush succeeds.
    pub async fn write_and_flush(&self, frame: Bytes) -> io::Result<()> {
        let output = self.transport.output();
        output.write(frame)?;
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
        let result = output.flush().await;
        self.backpressured.store(false, Ordering::Release);
        result
    }
}

impl std::fmt::Debug for PipeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConnection")
            .field("backpressured", &self.is_backpressured())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportOptions;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use storm_wire::{DelimiterFramer, LengthPrefixFramer};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    /// In-memory transport plus the raw peer end; no socket involved.
    async fn duplex_pair(
        capacity: usize,
        options: TransportOptions,
    ) -> (Arc<Transport>, DuplexStream) {
        let (local, remote) = duplex(capacity);
        let transport = Arc::new(Transport::from_stream(local, options));
        transport.handshake().await.unwrap();
        (transport, remote)
    }

    #[tokio::test]
    async fn dispatches_framed_messages_in_order() {
        let (transport, mut peer) = duplex_pair(64 * 1024, TransportOptions::default()).await;
        let conn = Arc::new(PipeConnection::new(
            transport.clone(),
            Box::new(DelimiterFramer::new()),
        ));

        peer.write_all(b"first\nsecond\nthi").await.unwrap();
        peer.flush().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let loop_task = tokio::spawn({
            let conn = conn.clone();
            let received = received.clone();
            let cancel = cancel.clone();
            async move {
                conn.run(&cancel, |msg| {
                    received.lock().unwrap().push(msg);
                    async {}
                })
                .await
            }
        });

        peer.write_all(b"rd\n").await.unwrap();
        peer.shutdown().await.unwrap();

        loop_task.await.unwrap().unwrap();
        let received = received.lock().unwrap();
        assert_eq!(
            received.as_slice(),
            &[
                Bytes::from_static(b"first"),
                Bytes::from_static(b"second"),
                Bytes::from_static(b"third"),
            ]
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn framing_error_terminates_the_loop() {
        let (transport, mut peer) = duplex_pair(64 * 1024, TransportOptions::default()).await;
        let conn = PipeConnection::new(transport.clone(), Box::new(LengthPrefixFramer::new()));

        // Length header with the sign bit set.
        peer.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();
        peer.flush().await.unwrap();

        let cancel = CancellationToken::new();
        let err = conn.run(&cancel, |_| async {}).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        transport.close().await;
    }

    #[tokio::test]
    async fn backpressure_hook_fires_once() {
        // The unread peer end caps the duplex at 128 bytes, so the
        // outbound pump wedges almost immediately and the 64-byte pipe
        // stays saturated.
        let (transport, _peer) = duplex_pair(
            128,
            TransportOptions {
                max_pending_receive_bytes: 1024 * 1024,
                max_pending_send_bytes: 64,
            },
        )
        .await;
        let conn = Arc::new(PipeConnection::new(
            transport.clone(),
            Box::new(DelimiterFramer::new()),
        ));

        let fired = Arc::new(AtomicUsize::new(0));
        conn.set_backpressure_hook({
            let fired = fired.clone();
            Arc::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        });

        let flood = tokio::spawn({
            let conn = conn.clone();
            async move {
                let payload = vec![b'x'; 256];
                loop {
                    if conn.send(&payload).await.is_err() {
                        break;
                    }
                }
            }
        });

        timeout(Duration::from_secs(5), async {
            while !conn.is_backpressured() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        flood.abort();
        transport.close().await;
    }
}
