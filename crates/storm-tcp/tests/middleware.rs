//! Middleware pipeline behavior against a live server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use storm_session::{Middleware, Session};
use storm_tcp::{TcpClient, TcpClientOptions, TcpServer, TcpServerOptions, TcpSession};

const WAIT: Duration = Duration::from_secs(5);

/// Uppercases inbound payloads and refuses to send anything containing
/// the word "secret".
struct Scrubber;

#[async_trait]
impl Middleware<TcpSession> for Scrubber {
    async fn on_data_received(
        &self,
        _session: &Arc<TcpSession>,
        data: Bytes,
    ) -> Option<Bytes> {
        Some(Bytes::from(data.to_ascii_uppercase()))
    }

    async fn on_data_sending(&self, _session: &Arc<TcpSession>, data: Bytes) -> Option<Bytes> {
        if data.windows(6).any(|w| w.eq_ignore_ascii_case(b"secret")) {
            None
        } else {
            Some(data)
        }
    }
}

#[tokio::test]
async fn receive_stage_transforms_and_send_stage_drops() {
    let mut server = TcpServer::new(TcpServerOptions::new("127.0.0.1:0".parse().unwrap()));
    server.use_middleware(Scrubber);
    server.on_data_received(|event| async move {
        // Echo what middleware produced, then attempt a leak that the
        // send stage must drop.
        let _ = event.session.send(event.data).await;
        let _ = event
            .session
            .send(Bytes::from_static(b"the secret reply"))
            .await;
        let _ = event.session.send(Bytes::from_static(b"clean reply")).await;
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = TcpClient::new(TcpClientOptions::new(addr.to_string()));
    client.on_data_received(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.data);
        }
    });
    client.connect().await.unwrap();

    client.send(Bytes::from_static(b"hello")).await.unwrap();

    // Raw framing may merge the two surviving replies into one chunk.
    let mut received = Vec::new();
    while received.len() < "HELLO".len() + "clean reply".len() {
        let chunk = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(&received[..], b"HELLOclean reply");

    // The dropped send left no trace in the metrics either.
    let session = server.sessions().unwrap().snapshot()[0].clone();
    assert_eq!(
        session.metrics().bytes_sent,
        ("HELLO".len() + "clean reply".len()) as u64
    );

    client.disconnect().await;
    server.stop().await;
}
