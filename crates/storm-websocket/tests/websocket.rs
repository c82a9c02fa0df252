//! End-to-end WebSocket scenarios over loopback sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use storm_session::{Session, SessionState, SlowConsumerPolicy};
use storm_websocket::{
    HeartbeatOptions, WsClient, WsClientOptions, WsConnectError, WsServer, WsServerOptions,
};
use storm_wire::{close_status, parse_close_payload, Opcode, WsFrame, WsFrameCodec};

const WAIT: Duration = Duration::from_secs(5);

/// Opt into log output with e.g. `RUST_LOG=storm_websocket=trace`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn server_options() -> WsServerOptions {
    init_tracing();
    WsServerOptions::new("127.0.0.1:0".parse().unwrap())
}

/// Open a socket and complete the upgrade by hand, without running a
/// frame loop. Returns the stream positioned just past the 101 response.
async fn raw_upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = "GET /raw HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "EOF during upgrade");
        head.extend_from_slice(&chunk[..n]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"), "upgrade not accepted");
    assert!(
        std::str::from_utf8(&head)
            .unwrap()
            .contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
        "wrong accept key"
    );
    stream
}

/// Read frames from a raw stream until one matching `want` arrives.
async fn read_frame(stream: &mut TcpStream, want: Opcode) -> WsFrame {
    let mut codec = WsFrameCodec::client();
    let mut acc = BytesMut::new();
    let mut chunk = [0u8; 1024];
    loop {
        while let Some(frame) = codec.decode(&mut acc).unwrap() {
            if frame.opcode == want {
                return frame;
            }
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "EOF while waiting for {want:?} frame");
        acc.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn text_echo_roundtrip() {
    let mut server = WsServer::new(server_options());
    server.on_message_received(|event| async move {
        if event.message.is_text {
            let text = event.message.text().unwrap().to_string();
            let _ = event.session.send_text(text).await;
        }
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = WsClient::new(WsClientOptions::new(format!("ws://{addr}/echo")));
    client.on_message_received(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.message);
        }
    });
    client.connect().await.unwrap();

    client.send_text("Hello WebSocket!").await.unwrap();
    let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(message.is_text);
    assert_eq!(message.text(), Some("Hello WebSocket!"));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn heartbeat_keeps_responsive_clients_alive() {
    let mut options = server_options();
    options.websocket.heartbeat = HeartbeatOptions {
        ping_interval: Duration::from_millis(200),
        max_missed_pongs: 3,
        auto_pong: true,
    };
    let disconnected = Arc::new(AtomicBool::new(false));
    let mut server = WsServer::new(options);
    server.on_disconnected({
        let disconnected = disconnected.clone();
        move |_session| {
            let disconnected = disconnected.clone();
            async move {
                disconnected.store(true, Ordering::SeqCst);
            }
        }
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = WsClient::new(WsClientOptions::new(format!("ws://{addr}/")));
    client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(server.session_count(), 1);
    assert!(!disconnected.load(Ordering::SeqCst));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn dead_connection_is_disconnected_by_heartbeat() {
    let mut options = server_options();
    options.websocket.heartbeat = HeartbeatOptions {
        ping_interval: Duration::from_millis(100),
        max_missed_pongs: 2,
        auto_pong: true,
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut server = WsServer::new(options);
    server.on_disconnected(move |session| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(session.id());
        }
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // Upgrade by hand and then never answer a single ping.
    let stream = raw_upgrade(addr).await;

    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(server.session_count(), 0);

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn slow_consumer_drop_policy_sheds_sends() {
    let mut options = server_options();
    options.max_pending_send_bytes = 1024;
    options.slow_consumer_policy = SlowConsumerPolicy::Drop;
    // No pings: the flooded pipe must stay backpressured undisturbed.
    options.websocket.heartbeat.ping_interval = Duration::ZERO;
    let mut server = WsServer::new(options);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // Upgrade by hand and then never read a byte.
    let stream = raw_upgrade(addr).await;

    let session = timeout(WAIT, async {
        loop {
            if let Some(sessions) = server.sessions() {
                if let Some(session) = sessions.snapshot().into_iter().next() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Flood until a send wedges in the flush; loopback kernel buffers
    // absorb a bounded amount first.
    let flooder = tokio::spawn({
        let session = session.clone();
        async move {
            let chunk = Bytes::from(vec![0u8; 4096]);
            loop {
                if session.send(chunk.clone()).await.is_err() {
                    break;
                }
                if session.is_backpressured() {
                    break;
                }
            }
        }
    });

    timeout(WAIT, async {
        while !session.is_backpressured() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(session.state(), SessionState::Connected);
    let sent_before = session.metrics().bytes_sent;

    // A send under backpressure with the Drop policy returns at once
    // and leaves the counter untouched.
    timeout(Duration::from_secs(1), session.send(Bytes::from(vec![1u8; 4096])))
        .await
        .expect("drop-policy send must not block")
        .unwrap();
    assert_eq!(session.metrics().bytes_sent, sent_before);
    assert_eq!(session.state(), SessionState::Connected);

    flooder.abort();
    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn handshake_timeout_closes_silent_sockets() {
    let mut options = server_options();
    options.websocket.handshake_timeout = Duration::from_millis(500);
    let connected = Arc::new(AtomicBool::new(false));
    let mut server = WsServer::new(options);
    server.on_connected({
        let connected = connected.clone();
        move |_session| {
            let connected = connected.clone();
            async move {
                connected.store(true, Ordering::SeqCst);
            }
        }
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // Open a socket and say nothing.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "silent socket should see EOF");
    assert!(!connected.load(Ordering::SeqCst), "no session, no events");
    assert_eq!(server.session_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn close_handshake_echoes_peer_status() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut server = WsServer::new(server_options());
    server.on_disconnected(move |session| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(session.id());
        }
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = raw_upgrade(addr).await;

    // Send a masked Close(1000) and expect the echo.
    let mut codec = WsFrameCodec::client();
    let mut wire = BytesMut::new();
    codec
        .encode(&WsFrame::close(Some(close_status::NORMAL)), &mut wire)
        .unwrap();
    stream.write_all(&wire).await.unwrap();

    let close = timeout(WAIT, read_frame(&mut stream, Opcode::Close))
        .await
        .unwrap();
    let (status, _) = parse_close_payload(&close.payload);
    assert_eq!(status, Some(close_status::NORMAL));

    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(server.session_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn close_echo_coerces_reserved_status_codes() {
    let mut server = WsServer::new(server_options());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = raw_upgrade(addr).await;

    // 999 is below the sendable range; the echo must come back as 1000.
    let mut codec = WsFrameCodec::client();
    let mut wire = BytesMut::new();
    codec
        .encode(&WsFrame::close(Some(999)), &mut wire)
        .unwrap();
    stream.write_all(&wire).await.unwrap();

    let close = timeout(WAIT, read_frame(&mut stream, Opcode::Close))
        .await
        .unwrap();
    let (status, _) = parse_close_payload(&close.payload);
    assert_eq!(status, Some(close_status::NORMAL));

    server.stop().await;
}

#[tokio::test]
async fn protocol_errors_close_with_carried_status() {
    let mut server = WsServer::new(server_options());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = raw_upgrade(addr).await;

    // Reserved bit set: the server must answer Close(1002) and hang up.
    stream.write_all(&[0xC1, 0x80, 0, 0, 0, 0]).await.unwrap();

    let close = timeout(WAIT, read_frame(&mut stream, Opcode::Close))
        .await
        .unwrap();
    let (status, _) = parse_close_payload(&close.payload);
    assert_eq!(status, Some(close_status::PROTOCOL_ERROR));

    server.stop().await;
}

#[tokio::test]
async fn authorization_hook_can_reject() {
    let mut server = WsServer::new(server_options());
    server.on_connecting(|context| async move {
        if context.path() != "/allowed" {
            let _ = context.reject(429, "slow down");
        }
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut denied = WsClient::new(WsClientOptions::new(format!("ws://{addr}/other")));
    let err = denied.connect().await.unwrap_err();
    match err {
        WsConnectError::Upgrade(storm_wire::UpgradeError::NotSwitchingProtocols(status)) => {
            assert_eq!(status, 429);
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut allowed = WsClient::new(WsClientOptions::new(format!("ws://{addr}/allowed")));
    allowed.connect().await.unwrap();
    allowed.disconnect().await;

    server.stop().await;
}

#[tokio::test]
async fn origin_allow_list_rejects_unknown_origins() {
    let mut options = server_options();
    options.websocket.allowed_origins = vec!["https://ok.example".to_string()];
    let mut server = WsServer::new(options);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // No Origin header at all: forbidden when an allow-list is set.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = "GET / HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
    }
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 403 Forbidden"));
    assert!(response.contains("Origin not allowed"));
    assert_eq!(server.session_count(), 0);

    server.stop().await;
}
