//! Client session pool
//!
//! A fixed number of slots, each holding one multiplexed session. Accepted
//! connections are spread over the slots round-robin. A slot whose session
//! has died or outlived `autoexpire` is refilled on demand while its lock is
//! held, and the old session goes to the scavenger.

pub mod scavenger;

pub use scavenger::{ScavengerHandle, SCAVENGE_INTERVAL, SCAVENGE_QUEUE};

use crate::config::ClientConfig;
use crate::relay::Relay;
use crate::tunnel::{Connector, Session, TunnelError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pause between failed dial attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool shut down")]
    Cancelled,

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of slots
    pub size: usize,
    /// Replace a session this long after it was dialed
    pub auto_expire: Option<Duration>,
    /// Force-close retired sessions after this long
    pub scavenge_ttl: Option<Duration>,
    pub retry_interval: Duration,
}

impl PoolConfig {
    pub fn from_client(config: &ClientConfig) -> Self {
        Self {
            size: config.conn.max(1),
            auto_expire: config.auto_expire(),
            scavenge_ttl: config.scavenge_ttl(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

struct Slot<S> {
    session: Arc<S>,
    expires_at: Option<Instant>,
}

impl<S> Slot<S> {
    fn new(session: S, auto_expire: Option<Duration>) -> Self {
        Self {
            session: Arc::new(session),
            expires_at: auto_expire.map(|ttl| Instant::now() + ttl),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() > at)
    }
}

/// Keep dialing until a session is up. Returns `None` only on shutdown.
pub async fn dial_until_success<C: Connector>(
    connector: &C,
    retry_interval: Duration,
    shutdown: &CancellationToken,
) -> Option<C::Session> {
    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return None,
            r = connector.connect() => r,
        };
        match attempt {
            Ok(session) => return Some(session),
            Err(e) => warn!("re-connecting: {}", e),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
}

/// Round-robin pool of sessions
pub struct SessionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    slots: Vec<Mutex<Slot<C::Session>>>,
    rr: AtomicUsize,
    scavenger: ScavengerHandle<C::Session>,
    scavenger_task: JoinHandle<()>,
    relay: Relay,
    shutdown: CancellationToken,
}

impl<C: Connector> SessionPool<C> {
    /// Fill every slot, retrying each until it connects
    pub async fn connect(
        connector: C,
        config: PoolConfig,
        relay: Relay,
        shutdown: CancellationToken,
    ) -> Result<Self, PoolError> {
        let shutdown = shutdown.child_token();
        let (scavenger, scavenger_task) = scavenger::spawn(config.scavenge_ttl, shutdown.clone());

        let size = config.size.max(1);
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            let session = dial_until_success(&connector, config.retry_interval, &shutdown)
                .await
                .ok_or(PoolError::Cancelled)?;
            slots.push(Mutex::new(Slot::new(session, config.auto_expire)));
        }

        Ok(Self {
            connector,
            config,
            slots,
            rr: AtomicUsize::new(0),
            scavenger,
            scavenger_task,
            relay,
            shutdown,
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Slot for the next accepted connection
    pub fn next_slot(&self) -> usize {
        self.rr.fetch_add(1, Ordering::Relaxed) % self.slots.len()
    }

    /// Open a stream on slot `idx`, replacing its session first if it is
    /// closed or expired
    pub async fn open_stream(
        &self,
        idx: usize,
    ) -> Result<<C::Session as Session>::Stream, PoolError> {
        Ok(self.open_routed(idx).await?.0)
    }

    /// Like [`open_stream`](Self::open_stream), also returning the remote
    /// address of the session carrying the stream
    async fn open_routed(
        &self,
        idx: usize,
    ) -> Result<(<C::Session as Session>::Stream, SocketAddr), PoolError> {
        let mut slot = self.slots[idx % self.slots.len()].lock().await;

        let closed = slot.session.is_closed();
        if closed || slot.expired() {
            debug!(
                "slot {} session {} {}, replacing",
                idx,
                slot.session.remote_addr(),
                if closed { "closed" } else { "expired" }
            );
            self.scavenger.retire(Arc::clone(&slot.session)).await;

            let session =
                dial_until_success(&self.connector, self.config.retry_interval, &self.shutdown)
                    .await
                    .ok_or(PoolError::Cancelled)?;
            *slot = Slot::new(session, self.config.auto_expire);
        }

        let stream = slot.session.open_stream().await?;
        Ok((stream, slot.session.remote_addr()))
    }

    /// Carry one accepted connection from `peer` over slot `idx`. If no
    /// stream can be opened the connection is dropped.
    pub async fn dispatch<T>(&self, idx: usize, peer: SocketAddr, conn: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        match self.open_routed(idx).await {
            Ok((stream, remote)) => {
                let route = format!("{} -> {}", peer, remote);
                self.relay.run(&route, conn, stream).await;
            }
            Err(e) => warn!("open stream on slot {}: {}", idx, e),
        }
    }

    /// Close every slot's session and stop the scavenger. Cancelling first
    /// releases slots held by a redial in progress.
    pub async fn close(&self) {
        self.shutdown.cancel();
        for slot in &self.slots {
            slot.lock().await.session.close();
        }
    }
}

impl<C: Connector> Drop for SessionPool<C> {
    fn drop(&mut self) {
        self.scavenger_task.abort();
    }
}
