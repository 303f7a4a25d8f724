//! Integration tests for sskcp
//!
//! Runs the whole stack over loopback: TCP client -> session pool ->
//! encrypted KCP over UDP -> server -> TCP echo target.

use sskcp::client::Client;
use sskcp::config::{CipherKind, TransportConfig};
use sskcp::pool::{PoolConfig, SessionPool};
use sskcp::relay::Relay;
use sskcp::server::Server;
use sskcp::tunnel::{Acceptor, Connector, SecureDialer, SecureListener, Session};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn transport_config(key: &str) -> TransportConfig {
    TransportConfig {
        key: key.to_string(),
        crypt: CipherKind::Aes,
        ..TransportConfig::default()
    }
}

/// TCP echo server standing in for the protected service
async fn spawn_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = conn.into_split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Start a tunnel server relaying to `target`, returning its UDP address
async fn spawn_server(config: &TransportConfig, target: SocketAddr, shutdown: CancellationToken) -> SocketAddr {
    let listener = SecureListener::bind("127.0.0.1:0", config).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(listener, &target.to_string(), Relay::default());
    tokio::spawn(async move { server.run(shutdown).await });
    addr
}

/// Start a tunnel client with `conn` pooled sessions, returning its TCP address
async fn spawn_client(
    config: &TransportConfig,
    remote: SocketAddr,
    conn: usize,
    shutdown: CancellationToken,
) -> SocketAddr {
    let dialer = SecureDialer::new(remote.to_string(), config).unwrap();
    let pool = SessionPool::connect(
        dialer,
        PoolConfig {
            size: conn,
            auto_expire: None,
            scavenge_ttl: Some(Duration::from_secs(600)),
            retry_interval: Duration::from_millis(100),
        },
        Relay::default(),
        shutdown.clone(),
    )
    .await
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = Client::new(listener, pool);
    tokio::spawn(async move { client.run(shutdown).await });
    addr
}

/// Send `payload` through the tunnel and read back the echo
async fn round_trip(client: SocketAddr, payload: Vec<u8>) -> Vec<u8> {
    let conn = TcpStream::connect(client).await.unwrap();
    let (mut r, mut w) = conn.into_split();
    let len = payload.len();

    let writer = tokio::spawn(async move {
        w.write_all(&payload).await.unwrap();
        w
    });

    let mut echoed = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(20), r.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    drop(writer.await.unwrap());
    echoed
}

#[tokio::test]
async fn test_round_trip_through_tunnel() {
    let shutdown = CancellationToken::new();
    let config = transport_config("integration");
    let target = spawn_echo_target().await;
    let server = spawn_server(&config, target, shutdown.clone()).await;
    let client = spawn_client(&config, server, 1, shutdown.clone()).await;

    for size in [0usize, 1, 1000, 1350 * 3, 200_000] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let echoed = round_trip(client, payload.clone()).await;
        assert_eq!(echoed, payload, "payload of {} bytes corrupted", size);
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_connection_closed_without_data() {
    let shutdown = CancellationToken::new();
    let config = transport_config("silent");
    let target = spawn_echo_target().await;
    let server = spawn_server(&config, target, shutdown.clone()).await;
    let client = spawn_client(&config, server, 1, shutdown.clone()).await;

    let mut conn = TcpStream::connect(client).await.unwrap();
    conn.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(10), conn.read_to_end(&mut rest))
        .await
        .expect("no EOF after closing an idle connection")
        .unwrap();
    assert_eq!(n, 0);

    // the pooled session survives and carries the next connection
    let payload = b"still here".to_vec();
    assert_eq!(round_trip(client, payload.clone()).await, payload);

    shutdown.cancel();
}

#[tokio::test]
async fn test_empty_stream_leaves_session_open() {
    let shutdown = CancellationToken::new();
    let config = transport_config("empty-stream");
    let target = spawn_echo_target().await;
    let server = spawn_server(&config, target, shutdown.clone()).await;

    let dialer = SecureDialer::new(server.to_string(), &config).unwrap();
    let session = dialer.connect().await.unwrap();

    let mut stream = session.open_stream().await.unwrap();
    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut rest))
        .await
        .expect("stream was not closed")
        .unwrap();
    assert_eq!(n, 0);
    assert!(!session.is_closed());

    let mut stream = session.open_stream().await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut echo))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echo, b"ping");

    session.close();
    shutdown.cancel();
}

#[tokio::test]
async fn test_uncompressed_round_trip() {
    let shutdown = CancellationToken::new();
    let config = TransportConfig {
        nocomp: true,
        ..transport_config("plain-stream")
    };
    let target = spawn_echo_target().await;
    let server = spawn_server(&config, target, shutdown.clone()).await;
    let client = spawn_client(&config, server, 1, shutdown.clone()).await;

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(round_trip(client, payload.clone()).await, payload);

    shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_connections_over_pool() {
    let shutdown = CancellationToken::new();
    let config = TransportConfig {
        crypt: CipherKind::Chacha20,
        ..transport_config("pooled")
    };
    let target = spawn_echo_target().await;
    let server = spawn_server(&config, target, shutdown.clone()).await;
    let client = spawn_client(&config, server, 3, shutdown.clone()).await;

    let mut tasks = Vec::new();
    for n in 0..8u8 {
        tasks.push(tokio::spawn(async move {
            let payload = vec![n; 20_000];
            let echoed = round_trip(client, payload.clone()).await;
            assert_eq!(echoed, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_plaintext_without_fec() {
    let shutdown = CancellationToken::new();
    let config = TransportConfig {
        crypt: CipherKind::None,
        datashard: 0,
        parityshard: 0,
        ..transport_config("unused")
    };
    let target = spawn_echo_target().await;
    let server = spawn_server(&config, target, shutdown.clone()).await;
    let client = spawn_client(&config, server, 1, shutdown.clone()).await;

    let payload = b"no crypto, no parity".to_vec();
    assert_eq!(round_trip(client, payload.clone()).await, payload);

    shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_target_only_loses_the_stream() {
    let shutdown = CancellationToken::new();
    let config = transport_config("target-down");
    let server = spawn_server(&config, closed_port().await, shutdown.clone()).await;

    let dialer = SecureDialer::new(server.to_string(), &config).unwrap();
    let session = dialer.connect().await.unwrap();

    for _ in 0..2 {
        let mut stream = session.open_stream().await.unwrap();
        stream.write_all(b"anyone there?").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .expect("stream was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(!session.is_closed());
    }

    session.close();
    shutdown.cancel();
}

#[tokio::test]
async fn test_mismatched_key_never_reaches_accept() {
    let listener = SecureListener::bind("127.0.0.1:0", &transport_config("right"))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let dialer = SecureDialer::new(addr.to_string(), &transport_config("wrong")).unwrap();
    let session = dialer.connect().await.unwrap();
    let _stream = tokio::spawn(async move {
        let stream = session.open_stream().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let accepted = tokio::time::timeout(Duration::from_millis(500), listener.accept()).await;
    assert!(accepted.is_err());
    assert!(listener.stats().snapshot().auth_failures > 0);
    listener.close();
}
