//! Frame-level server behavior driven by a hand-rolled client.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use storm_websocket::{WsServer, WsServerOptions};
use storm_wire::{Opcode, WsFrame, WsFrameCodec};

const WAIT: Duration = Duration::from_secs(5);

const UPGRADE_REQUEST: &str = "GET /frames HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\
    \r\n";

async fn read_past_upgrade(stream: &mut TcpStream) {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "EOF during upgrade");
        head.extend_from_slice(&chunk[..n]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"));
}

fn collecting_server() -> (WsServer, mpsc::UnboundedReceiver<(Vec<u8>, bool)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut server = WsServer::new(WsServerOptions::new("127.0.0.1:0".parse().unwrap()));
    server.on_message_received(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((event.message.data.to_vec(), event.message.is_text));
        }
    });
    (server, rx)
}

async fn start(server: &mut WsServer) -> SocketAddr {
    server.start().await.unwrap();
    server.local_addr().unwrap()
}

#[tokio::test]
async fn fragmented_messages_are_reassembled() {
    let (mut server, mut rx) = collecting_server();
    let addr = start(&mut server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();
    read_past_upgrade(&mut stream).await;

    // "Hello " + "fragmented " + "world" split across three frames.
    let mut codec = WsFrameCodec::client();
    let mut wire = BytesMut::new();
    let mut first = WsFrame::text("Hello ");
    first.fin = false;
    codec.encode(&first, &mut wire).unwrap();
    let middle = WsFrame {
        fin: false,
        opcode: Opcode::Continuation,
        masked: false,
        payload: bytes::Bytes::from_static(b"fragmented "),
    };
    codec.encode(&middle, &mut wire).unwrap();
    let last = WsFrame {
        fin: true,
        opcode: Opcode::Continuation,
        masked: false,
        payload: bytes::Bytes::from_static(b"world"),
    };
    codec.encode(&last, &mut wire).unwrap();
    stream.write_all(&wire).await.unwrap();

    let (data, is_text) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(is_text);
    assert_eq!(&data[..], b"Hello fragmented world");

    server.stop().await;
}

#[tokio::test]
async fn control_frames_pass_between_fragments() {
    let (mut server, mut rx) = collecting_server();
    let addr = start(&mut server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();
    read_past_upgrade(&mut stream).await;

    let mut codec = WsFrameCodec::client();
    let mut wire = BytesMut::new();
    let mut first = WsFrame::binary(&b"ab"[..]);
    first.fin = false;
    codec.encode(&first, &mut wire).unwrap();
    // A ping interleaved mid-message is legal.
    codec.encode(&WsFrame::ping(&b"hb"[..]), &mut wire).unwrap();
    let last = WsFrame {
        fin: true,
        opcode: Opcode::Continuation,
        masked: false,
        payload: bytes::Bytes::from_static(b"cd"),
    };
    codec.encode(&last, &mut wire).unwrap();
    stream.write_all(&wire).await.unwrap();

    let (data, is_text) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(!is_text);
    assert_eq!(&data[..], b"abcd");

    // The interleaved ping got its pong.
    let mut decode = WsFrameCodec::client();
    let mut acc = BytesMut::new();
    let mut chunk = [0u8; 256];
    let pong = loop {
        if let Some(frame) = decode.decode(&mut acc).unwrap() {
            if frame.opcode == Opcode::Pong {
                break frame;
            }
            continue;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        acc.extend_from_slice(&chunk[..n]);
    };
    assert_eq!(&pong.payload[..], b"hb");

    server.stop().await;
}

#[tokio::test]
async fn frames_pipelined_behind_the_upgrade_are_processed() {
    let (mut server, mut rx) = collecting_server();
    let addr = start(&mut server).await;

    // Upgrade request and the first frame in a single write.
    let mut codec = WsFrameCodec::client();
    let mut payload = BytesMut::from(UPGRADE_REQUEST.as_bytes());
    codec
        .encode(&WsFrame::text("no gap"), &mut payload)
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&payload).await.unwrap();
    read_past_upgrade(&mut stream).await;

    let (data, is_text) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(is_text);
    assert_eq!(&data[..], b"no gap");

    server.stop().await;
}

#[tokio::test]
async fn orphan_continuation_is_a_protocol_error() {
    let (mut server, _rx) = collecting_server();
    let addr = start(&mut server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();
    read_past_upgrade(&mut stream).await;

    let mut codec = WsFrameCodec::client();
    let mut wire = BytesMut::new();
    let orphan = WsFrame {
        fin: true,
        opcode: Opcode::Continuation,
        masked: false,
        payload: bytes::Bytes::from_static(b"lost"),
    };
    codec.encode(&orphan, &mut wire).unwrap();
    stream.write_all(&wire).await.unwrap();

    // The server answers Close(1002) and hangs up.
    let mut decode = WsFrameCodec::client();
    let mut acc = BytesMut::new();
    let mut chunk = [0u8; 256];
    let close = loop {
        if let Some(frame) = decode.decode(&mut acc).unwrap() {
            if frame.opcode == Opcode::Close {
                break frame;
            }
            continue;
        }
        let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
        assert!(n > 0, "EOF before close frame");
        acc.extend_from_slice(&chunk[..n]);
    };
    assert_eq!(&close.payload[..2], &1002u16.to_be_bytes());

    server.stop().await;
}
