//! TCP helpers for the plain side of the tunnel

use super::TransportError;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Dial the relay target, giving up after `timeout`. The returned stream
/// has Nagle disabled when the OS allows it.
pub async fn connect_timeout(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TransportError::ConnectionFailed(format!("{}: {}", addr, e))),
        Err(_) => return Err(TransportError::Timeout),
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!("set nodelay for {}: {}", addr, e);
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_target_stream_is_ready_for_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let target = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 5];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(b"ready").await.unwrap();
            greeting
        });

        let mut stream = connect_timeout(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());

        stream.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ready");
        assert_eq!(&target.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_closed_port_is_a_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_timeout(&addr, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert!(err.to_string().contains(&addr));
    }
}
