//! End-to-end echo scenarios over loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use storm_session::Session;
use storm_stream::FramerFactory;
use storm_tcp::{TcpClient, TcpClientOptions, TcpServer, TcpServerOptions};
use storm_wire::LengthPrefixFramer;

const WAIT: Duration = Duration::from_secs(5);

fn length_prefix_factory() -> FramerFactory {
    Arc::new(|| Box::new(LengthPrefixFramer::new()))
}

async fn start_echo_server(options: TcpServerOptions) -> TcpServer {
    let mut server = TcpServer::new(options);
    server.on_data_received(|event| async move {
        let _ = event.session.send(event.data).await;
    });
    server.start().await.unwrap();
    server
}

#[tokio::test]
async fn raw_echo_roundtrip() {
    let mut server =
        start_echo_server(TcpServerOptions::new("127.0.0.1:0".parse().unwrap())).await;
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

    let payload = Bytes::from_static(b"Hello StormSocket");
    assert_eq!(payload.len(), 17);
    client.send(payload.clone()).await.unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        let chunk = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        echoed.extend_from_slice(&chunk);
    }
    assert_eq!(&echoed[..], &payload[..]);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn length_prefix_echo_delivers_single_messages() {
    let mut options = TcpServerOptions::new("127.0.0.1:0".parse().unwrap());
    options.framer = Some(length_prefix_factory());

    // Capture what the server-side handler sees, too.
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let mut server = TcpServer::new(options);
    server.on_data_received(move |event| {
        let server_tx = server_tx.clone();
        async move {
            let _ = server_tx.send(event.data.clone());
            let _ = event.session.send(event.data).await;
        }
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client_options = TcpClientOptions::new(addr.to_string());
    client_options.framer = Some(length_prefix_factory());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = TcpClient::new(client_options);
    client.on_data_received(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.data);
        }
    });
    client.connect().await.unwrap();

    client
        .send(Bytes::from_static(b"Framed message!"))
        .await
        .unwrap();

    // The server handler gets one whole 15-byte message, not wire chunks.
    let server_seen = timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
    assert_eq!(&server_seen[..], b"Framed message!");

    // The client gets the 15 payload bytes back, not the 19 wire bytes.
    let echoed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(&echoed[..], b"Framed message!");
    assert_eq!(echoed.len(), 15);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_all_but_excluded() {
    let mut options = TcpServerOptions::new("127.0.0.1:0".parse().unwrap());
    options.framer = Some(length_prefix_factory());
    let mut server = TcpServer::new(options);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut make_client = || async {
        let mut client_options = TcpClientOptions::new(addr.to_string());
        client_options.framer = Some(length_prefix_factory());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = TcpClient::new(client_options);
        client.on_data_received(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.data);
            }
        });
        client.connect().await.unwrap();
        (client, rx)
    };

    let (mut a, mut a_rx) = make_client().await;
    let (mut b, mut b_rx) = make_client().await;

    // Wait until both sessions are registered.
    timeout(WAIT, async {
        while server.session_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let excluded = server.sessions().unwrap().snapshot()[0].id();
    server
        .broadcast(Bytes::from_static(b"to everyone"), Some(excluded))
        .await;
    server.broadcast(Bytes::from_static(b"to all"), None).await;

    // Within a session writes are ordered, so the non-excluded client
    // sees "to everyone" first and "to all" second, while the excluded
    // client sees only "to all" as its first message.
    let first_a = timeout(WAIT, a_rx.recv()).await.unwrap().unwrap();
    let first_b = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
    let mut firsts = [&first_a[..], &first_b[..]];
    firsts.sort();
    assert_eq!(firsts, [&b"to all"[..], &b"to everyone"[..]]);

    a.disconnect().await;
    b.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn lifecycle_events_fire_once_per_connection() {
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let (disconnected_tx, mut disconnected_rx) = mpsc::unbounded_channel();

    let mut server = TcpServer::new(TcpServerOptions::new("127.0.0.1:0".parse().unwrap()));
    server.on_connected(move |session| {
        let connected_tx = connected_tx.clone();
        async move {
            let _ = connected_tx.send(session.id());
        }
    });
    server.on_disconnected(move |session| {
        let disconnected_tx = disconnected_tx.clone();
        async move {
            let _ = disconnected_tx.send(session.id());
        }
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpClient::new(TcpClientOptions::new(addr.to_string()));
    client.connect().await.unwrap();

    let connected_id = timeout(WAIT, connected_rx.recv()).await.unwrap().unwrap();

    client.disconnect().await;
    let disconnected_id = timeout(WAIT, disconnected_rx.recv()).await.unwrap().unwrap();
    assert_eq!(connected_id, disconnected_id);

    // Exactly one of each.
    assert!(connected_rx.try_recv().is_err());
    assert!(disconnected_rx.try_recv().is_err());

    timeout(WAIT, async {
        while server.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    server.stop().await;
}

#[tokio::test]
async fn max_connections_gate_refuses_extra_sockets() {
    let mut options = TcpServerOptions::new("127.0.0.1:0".parse().unwrap());
    options.max_connections = 1;
    let mut server = start_echo_server(options).await;
    let addr = server.local_addr().unwrap();

    let mut first = TcpClient::new(TcpClientOptions::new(addr.to_string()));
    first.connect().await.unwrap();

    timeout(WAIT, async {
        while server.session_count() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The second socket is accepted at the TCP level but closed
    // immediately: its client observes EOF without ever seeing data.
    let second = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    use tokio::io::AsyncReadExt;
    let n = timeout(WAIT, async {
        let mut stream = second;
        stream.read(&mut buf).await.unwrap()
    })
    .await
    .unwrap();
    assert_eq!(n, 0, "gated socket should see EOF");
    assert_eq!(server.session_count(), 1);

    first.disconnect().await;
    server.stop().await;
}
