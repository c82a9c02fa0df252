//! Auto-reconnect behavior of the TCP client.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use storm_stream::ReconnectOptions;
use storm_tcp::{ConnectError, TcpClient, TcpClientOptions, TcpServer, TcpServerOptions};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    // Nothing listens on this port: bind to grab a free one, then drop it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut options = TcpClientOptions::new(addr.to_string());
    options.connect_timeout = Duration::from_secs(1);
    options.reconnect = ReconnectOptions {
        enabled: true,
        delay: Duration::from_millis(50),
        max_attempts: 2,
    };

    let (attempt_tx, mut attempt_rx) = mpsc::unbounded_channel();
    let mut client = TcpClient::new(options);
    client.on_reconnecting(move |attempt| {
        let attempt_tx = attempt_tx.clone();
        async move {
            let _ = attempt_tx.send(attempt.attempt);
        }
    });

    let err = timeout(WAIT, client.connect()).await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ConnectError::MaxAttemptsExceeded { attempts: 2 }
    ));

    // Both retries announced themselves first.
    assert_eq!(attempt_rx.recv().await, Some(1));
    assert_eq!(attempt_rx.recv().await, Some(2));

    client.disconnect().await;
}

#[tokio::test]
async fn reconnect_eventually_connects_when_server_appears() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut options = TcpClientOptions::new(addr.to_string());
    options.connect_timeout = Duration::from_secs(1);
    options.reconnect = ReconnectOptions {
        enabled: true,
        delay: Duration::from_millis(50),
        max_attempts: 0,
    };
    let mut client = TcpClient::new(options);

    // Bring the server up while the client is already retrying.
    let server_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut server = TcpServer::new(TcpServerOptions::new(addr));
        server.on_data_received(|event| async move {
            use storm_session::Session;
            let _ = event.session.send(event.data).await;
        });
        server.start().await.unwrap();
        server
    });

    timeout(WAIT, client.connect()).await.unwrap().unwrap();
    assert!(client.is_connected());
    client.send(Bytes::from_static(b"alive")).await.unwrap();

    client.disconnect().await;
    let mut server = server_task.await.unwrap();
    server.stop().await;
}
