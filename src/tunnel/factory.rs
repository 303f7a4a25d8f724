//! Builds configured sessions on both ends of the tunnel
//!
//! Every connection gets the same treatment whether it was dialed or
//! accepted: retransmission knobs, window sizes, MTU and ack policy, then
//! snappy compression unless `nocomp` is set, then the multiplexer on top.
//! Socket tuning is best effort.

use super::{Acceptor, Connector, MuxConfig, MuxSession, Session, TunnelError};
use crate::config::TransportConfig;
use crate::crypto::{derive_key, PacketCipher};
use crate::transport::{
    self, CompStream, ReliableConn, ReliableListener, TransportError, TransportStats,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn build_cipher(config: &TransportConfig) -> Result<Arc<PacketCipher>, TunnelError> {
    let key = derive_key(&config.key, &config.salt);
    let cipher = PacketCipher::new(config.crypt, &key).map_err(TransportError::from)?;
    Ok(Arc::new(cipher))
}

fn configure(conn: &ReliableConn, config: &TransportConfig) -> Result<(), TunnelError> {
    let knobs = config.retransmission();
    conn.set_nodelay(knobs.nodelay, knobs.interval, knobs.resend, knobs.nc != 0);
    conn.set_window_size(config.sndwnd, config.rcvwnd);
    conn.set_mtu(config.mtu)?;
    conn.set_ack_nodelay(config.acknodelay);
    Ok(())
}

fn client_session(conn: ReliableConn, config: &TransportConfig, mux: MuxConfig) -> MuxSession {
    let local = conn.local_addr();
    let remote = conn.remote_addr();
    if config.nocomp {
        MuxSession::client(conn, mux, local, remote)
    } else {
        MuxSession::client(CompStream::new(conn), mux, local, remote)
    }
}

fn server_session(conn: ReliableConn, config: &TransportConfig, mux: MuxConfig) -> MuxSession {
    let local = conn.local_addr();
    let remote = conn.remote_addr();
    if config.nocomp {
        MuxSession::server(conn, mux, local, remote)
    } else {
        MuxSession::server(CompStream::new(conn), mux, local, remote)
    }
}

/// Apply DSCP and buffer sizes, logging whatever the OS refuses
macro_rules! tune_socket {
    ($target:expr, $config:expr) => {{
        if let Err(e) = $target.set_dscp($config.dscp) {
            warn!("set DSCP {}: {}", $config.dscp, e);
        }
        if let Err(e) = $target.set_read_buffer($config.sockbuf) {
            warn!("set read buffer {}: {}", $config.sockbuf, e);
        }
        if let Err(e) = $target.set_write_buffer($config.sockbuf) {
            warn!("set write buffer {}: {}", $config.sockbuf, e);
        }
    }};
}

/// Dials `remote` and returns a client-side session
pub struct SecureDialer {
    remote: String,
    config: TransportConfig,
    mux: MuxConfig,
    cipher: Arc<PacketCipher>,
    stats: Arc<TransportStats>,
}

impl SecureDialer {
    pub fn new(remote: impl Into<String>, config: &TransportConfig) -> Result<Self, TunnelError> {
        let mux = MuxConfig::from_transport(config);
        mux.validate()?;
        Ok(Self {
            remote: remote.into(),
            config: config.clone(),
            mux,
            cipher: build_cipher(config)?,
            stats: Arc::new(TransportStats::default()),
        })
    }

    /// Counters shared by every connection this dialer opens
    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Connector for SecureDialer {
    type Session = MuxSession;

    async fn connect(&self) -> Result<MuxSession, TunnelError> {
        let conn = transport::dial(
            &self.remote,
            Arc::clone(&self.cipher),
            self.config.datashard,
            self.config.parityshard,
            Arc::clone(&self.stats),
        )
        .await?;

        configure(&conn, &self.config)?;
        tune_socket!(conn, self.config);

        let session = client_session(conn, &self.config, self.mux.clone());
        info!("connection: {} -> {}", session.local_addr(), session.remote_addr());
        Ok(session)
    }
}

/// Accepts server-side sessions on a UDP address
pub struct SecureListener {
    listener: ReliableListener,
    config: TransportConfig,
    mux: MuxConfig,
    stats: Arc<TransportStats>,
}

impl SecureListener {
    pub async fn bind(addr: &str, config: &TransportConfig) -> Result<Self, TunnelError> {
        let mux = MuxConfig::from_transport(config);
        mux.validate()?;

        let stats = Arc::new(TransportStats::default());
        let listener = ReliableListener::bind(
            addr,
            build_cipher(config)?,
            config.datashard,
            config.parityshard,
            Arc::clone(&stats),
        )
        .await?;
        tune_socket!(listener, config);

        Ok(Self {
            listener,
            config: config.clone(),
            mux,
            stats,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Counters shared by every accepted connection
    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    pub fn close(&self) {
        self.listener.close();
    }
}

#[async_trait]
impl Acceptor for SecureListener {
    type Session = MuxSession;

    async fn accept(&self) -> Result<MuxSession, TunnelError> {
        let conn = self.listener.accept().await?;
        configure(&conn, &self.config)?;

        let session = server_session(conn, &self.config, self.mux.clone());
        info!("connection: {} -> {}", session.local_addr(), session.remote_addr());
        Ok(session)
    }
}

/// Log a counter snapshot every `period` until `shutdown` fires.
/// A zero period disables the log.
pub fn spawn_stats_logger(
    stats: Arc<TransportStats>,
    period: Duration,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => info!("stats: {}", stats.snapshot()),
            }
        }
    }))
}
