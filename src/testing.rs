//! In-memory sessions and connectors for unit tests

use crate::tunnel::{Acceptor, Connector, Session, TunnelError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeState {
    id: usize,
    streams: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicBool,
    fail_open: AtomicBool,
    /// Peer ends of opened streams, kept so they stay connected
    peers: Mutex<Vec<DuplexStream>>,
}

/// A session whose stream count and state are set by the test
#[derive(Clone)]
pub struct FakeSession {
    state: Arc<FakeState>,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<DuplexStream>>>,
}

impl FakeSession {
    pub fn new(id: usize) -> Self {
        Self::with_incoming(id).0
    }

    /// A session plus the sender feeding its `accept_stream`
    pub fn with_incoming(id: usize) -> (Self, mpsc::Sender<DuplexStream>) {
        let (tx, rx) = mpsc::channel(16);
        let session = Self {
            state: Arc::new(FakeState {
                id,
                ..FakeState::default()
            }),
            incoming: Arc::new(tokio::sync::Mutex::new(rx)),
        };
        (session, tx)
    }

    pub fn id(&self) -> usize {
        self.state.id
    }

    pub fn set_streams(&self, n: usize) {
        self.state.streams.store(n, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Take the far end of the most recently opened stream
    pub fn take_peer(&self) -> Option<DuplexStream> {
        self.state.peers.lock().pop()
    }
}

#[async_trait]
impl Session for FakeSession {
    type Stream = DuplexStream;

    async fn open_stream(&self) -> Result<DuplexStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(TunnelError::StreamClosed);
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = duplex(4096);
        self.state.peers.lock().push(remote);
        Ok(local)
    }

    async fn accept_stream(&self) -> Result<DuplexStream, TunnelError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(TunnelError::SessionClosed)
    }

    fn num_streams(&self) -> usize {
        self.state.streams.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1000))
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 2000 + self.state.id as u16))
    }
}

/// Hands out numbered [`FakeSession`]s, optionally failing first
#[derive(Default)]
pub struct FakeConnector {
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    always_fail: AtomicBool,
    sessions: Mutex<Vec<FakeSession>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` attempts
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<FakeSession> {
        self.sessions.lock().clone()
    }
}

fn refused() -> TunnelError {
    TunnelError::Io(std::io::ErrorKind::ConnectionRefused.into())
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> Result<FakeSession, TunnelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(refused());
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(refused());
        }

        let mut sessions = self.sessions.lock();
        let session = FakeSession::new(sessions.len());
        sessions.push(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl<C: Connector> Connector for Arc<C> {
    type Session = C::Session;

    async fn connect(&self) -> Result<C::Session, TunnelError> {
        self.as_ref().connect().await
    }
}

/// Yields sessions pushed by the test, or errors when told to
pub struct FakeAcceptor {
    rx: tokio::sync::Mutex<mpsc::Receiver<Result<FakeSession, TunnelError>>>,
}

impl FakeAcceptor {
    pub fn new() -> (Self, mpsc::Sender<Result<FakeSession, TunnelError>>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                rx: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }
}

#[async_trait]
impl Acceptor for FakeAcceptor {
    type Session = FakeSession;

    async fn accept(&self) -> Result<FakeSession, TunnelError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(r) => r,
            None => std::future::pending().await,
        }
    }
}
