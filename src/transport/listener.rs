//! Server side of the reliable transport
//!
//! One UDP socket serves every peer. A demux task decrypts each datagram and
//! routes it to the connection registered for the sender's address, creating
//! a new connection when an unknown peer sends a valid first segment.

use super::conn::{ConnParams, ReliableConn, INBOUND_QUEUE, KCP_HEADER_SIZE, MAX_DATAGRAM};
use super::fec;
use super::stats::{self, TransportStats};
use super::TransportError;
use crate::crypto::PacketCipher;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Connections waiting for `accept`
const ACCEPT_BACKLOG: usize = 128;

type PeerTable = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

/// Accepts reliable connections on a UDP socket
pub struct ReliableListener {
    socket: Arc<UdpSocket>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<ReliableConn>>,
    peers: PeerTable,
    shutdown: CancellationToken,
}

impl ReliableListener {
    /// Bind `addr` and start demultiplexing
    pub async fn bind(
        addr: &str,
        cipher: Arc<PacketCipher>,
        data_shards: usize,
        parity_shards: usize,
        stats: Arc<TransportStats>,
    ) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let demux = Demux {
            socket: Arc::clone(&socket),
            cipher,
            data_shards,
            parity_shards,
            stats,
            peers: Arc::clone(&peers),
            accept_tx,
        };
        tokio::spawn(demux.run(shutdown.clone()));

        Ok(Self {
            socket,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            peers,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the next new connection
    pub async fn accept(&self) -> Result<ReliableConn, TransportError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            conn = rx.recv() => conn.ok_or(TransportError::Closed),
        }
    }

    /// Number of peers with a live connection
    pub fn num_peers(&self) -> usize {
        self.peers.lock().len()
    }

    /// Stop demultiplexing. Connections already accepted lose their inbound path.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn set_dscp(&self, dscp: u32) -> io::Result<()> {
        super::socket::set_dscp(&self.socket, dscp)
    }

    pub fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        super::socket::set_read_buffer(&self.socket, bytes)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        super::socket::set_write_buffer(&self.socket, bytes)
    }
}

impl Drop for ReliableListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Conversation id of a KCP segment, if `payload` holds a whole header
fn peek_conv(payload: &[u8]) -> Option<u32> {
    if payload.len() < KCP_HEADER_SIZE {
        return None;
    }
    Some(kcp::get_conv(payload))
}

struct Demux {
    socket: Arc<UdpSocket>,
    cipher: Arc<PacketCipher>,
    data_shards: usize,
    parity_shards: usize,
    stats: Arc<TransportStats>,
    peers: PeerTable,
    accept_tx: mpsc::Sender<ReliableConn>,
}

impl Demux {
    async fn run(self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset
                        || e.kind() == io::ErrorKind::ConnectionRefused => continue,
                    Err(e) => {
                        warn!("listener receive failed: {}", e);
                        break;
                    }
                },
            };

            stats::add(&self.stats.in_pkts, 1);
            stats::add(&self.stats.bytes_received, n as u64);

            let plaintext = match self.cipher.open(&mut buf[..n]) {
                Ok(p) => Bytes::copy_from_slice(p),
                Err(e) => {
                    stats::add(&self.stats.auth_failures, 1);
                    trace!("dropping datagram from {}: {}", from, e);
                    continue;
                }
            };

            self.route(from, plaintext);
        }

        // dropping the senders ends every connection driver
        self.peers.lock().clear();
    }

    fn route(&self, from: SocketAddr, packet: Bytes) {
        let existing = self.peers.lock().get(&from).cloned();
        if let Some(tx) = existing {
            if tx.try_send(packet).is_err() {
                trace!("inbound queue for {} full, dropping datagram", from);
            }
            return;
        }

        let first = if self.data_shards > 0 && self.parity_shards > 0 {
            fec::data_payload(&packet)
        } else {
            Some(&packet[..])
        };
        // parity shards and runts cannot start a connection
        let Some(conv) = first.and_then(peek_conv) else {
            trace!("ignoring stray datagram from {}", from);
            return;
        };

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let peers = Arc::clone(&self.peers);
        let conn = ReliableConn::start(
            ConnParams {
                socket: Arc::clone(&self.socket),
                peer: from,
                connected: false,
                conv,
                cipher: Arc::clone(&self.cipher),
                data_shards: self.data_shards,
                parity_shards: self.parity_shards,
                stats: Arc::clone(&self.stats),
            },
            rx,
            move || {
                peers.lock().remove(&from);
            },
        );
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                warn!("failed to create connection for {}: {}", from, e);
                return;
            }
        };

        let _ = tx.try_send(packet);
        self.peers.lock().insert(from, tx);

        match self.accept_tx.try_send(conn) {
            Ok(()) => {
                stats::add(&self.stats.passive_opens, 1);
                debug!("new connection from {} conv {}", from, conv);
            }
            Err(_) => {
                // dropping the connection closes it and its driver unregisters it
                warn!("accept backlog full, refusing {}", from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CipherKind;
    use crate::crypto::derive_key;
    use crate::transport::conn::dial;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn cipher() -> Arc<PacketCipher> {
        let key = derive_key("secret", "salt");
        Arc::new(PacketCipher::new(CipherKind::Aes, &key).unwrap())
    }

    #[tokio::test]
    async fn test_dial_accept_echo() {
        let stats = Arc::new(TransportStats::default());
        let listener = ReliableListener::bind("127.0.0.1:0", cipher(), 10, 3, Arc::clone(&stats))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            conn.set_nodelay(1, 10, 2, true);
            let mut buf = vec![0u8; 5000];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            // keep the connection alive until the client has read the echo
            let mut rest = [0u8; 1];
            let _ = conn.read(&mut rest).await;
        });

        let mut conn = dial(&addr, cipher(), 10, 3, Arc::new(TransportStats::default()))
            .await
            .unwrap();
        conn.set_nodelay(1, 10, 2, true);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        conn.write_all(&payload).await.unwrap();
        let mut echo = vec![0u8; payload.len()];
        conn.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, payload);

        conn.close();
        server.abort();
        assert!(stats.passive_opens.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_segments_larger_than_the_read_buffer() {
        let listener = ReliableListener::bind(
            "127.0.0.1:0",
            cipher(),
            0,
            0,
            Arc::new(TransportStats::default()),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
        let expected = payload.clone();
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 7];
            while received.len() < expected.len() {
                let n = conn.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&chunk[..n]);
            }
            received
        });

        let mut conn = dial(&addr, cipher(), 0, 0, Arc::new(TransportStats::default()))
            .await
            .unwrap();
        conn.set_nodelay(1, 10, 2, true);
        conn.write_all(&payload).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);
        conn.close();
    }

    #[test]
    fn test_peek_conv_needs_a_full_header() {
        let mut segment = vec![0u8; KCP_HEADER_SIZE];
        segment[..4].copy_from_slice(&0x0102_0304u32.to_le_bytes());
        assert_eq!(peek_conv(&segment), Some(0x0102_0304));
        assert_eq!(peek_conv(&segment[..KCP_HEADER_SIZE - 1]), None);
        assert_eq!(peek_conv(&[]), None);
    }

    #[tokio::test]
    async fn test_wrong_key_is_not_accepted() {
        let stats = Arc::new(TransportStats::default());
        let listener = ReliableListener::bind("127.0.0.1:0", cipher(), 0, 0, Arc::clone(&stats))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let other = Arc::new(PacketCipher::new(CipherKind::Aes, &derive_key("other", "salt")).unwrap());
        let mut conn = dial(&addr, other, 0, 0, Arc::new(TransportStats::default()))
            .await
            .unwrap();
        conn.write_all(b"hello").await.unwrap();

        let accepted =
            tokio::time::timeout(std::time::Duration::from_millis(300), listener.accept()).await;
        assert!(accepted.is_err());
        assert!(stats.auth_failures.load(std::sync::atomic::Ordering::Relaxed) > 0);
        assert_eq!(listener.num_peers(), 0);
    }
}
