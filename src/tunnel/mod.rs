//! Tunnel layer - multiplexed sessions over the reliable transport
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream multiplexing with a shared receive budget
//! - Keep-alive
//! - The dial/listen factory that builds configured sessions

mod factory;
mod frame;
mod multiplexer;
mod stream;

pub use factory::{spawn_stats_logger, SecureDialer, SecureListener};
pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE};
pub use multiplexer::MuxSession;
pub use stream::MuxStream;

use crate::config::TransportConfig;
use crate::transport::TransportError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    #[error("Invalid mux config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Default maximum payload per data frame (32 KB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32768;

/// Keep-alive timeout never drops below this
pub const MIN_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Multiplexer settings
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How often a NOP is sent
    pub keep_alive_interval: Duration,
    /// Session closes when nothing arrives for this long
    pub keep_alive_timeout: Duration,
    /// Largest payload in one data frame
    pub max_frame_size: usize,
    /// Bytes buffered across all streams before the reader pauses
    pub max_receive_buffer: usize,
}

impl MuxConfig {
    /// Keep-alive and buffer sizes from the transport settings
    pub fn from_transport(config: &TransportConfig) -> Self {
        let interval = config.keepalive_interval();
        Self {
            keep_alive_interval: interval,
            keep_alive_timeout: (interval * 3).max(MIN_KEEPALIVE_TIMEOUT),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_receive_buffer: config.sockbuf,
        }
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.keep_alive_interval.is_zero() {
            return Err(TunnelError::Config("keep-alive interval must be positive".into()));
        }
        if self.keep_alive_timeout < self.keep_alive_interval {
            return Err(TunnelError::Config(
                "keep-alive timeout is shorter than the interval".into(),
            ));
        }
        if self.max_frame_size == 0 || self.max_frame_size > frame::MAX_PAYLOAD_SIZE {
            return Err(TunnelError::Config(format!(
                "max frame size must be in 1..={}",
                frame::MAX_PAYLOAD_SIZE
            )));
        }
        if self.max_receive_buffer == 0 {
            return Err(TunnelError::Config("max receive buffer must be positive".into()));
        }
        Ok(())
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from_transport(&TransportConfig::default())
    }
}

/// A multiplexed session carrying virtual streams
#[async_trait]
pub trait Session: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new outbound stream
    async fn open_stream(&self) -> Result<Self::Stream, TunnelError>;

    /// Wait for the peer to open a stream
    async fn accept_stream(&self) -> Result<Self::Stream, TunnelError>;

    /// Streams currently open on this session
    fn num_streams(&self) -> usize;

    fn is_closed(&self) -> bool;

    /// Close the session and every stream on it. Idempotent.
    fn close(&self);

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;
}

/// Produces outbound sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session, TunnelError>;
}

/// Yields inbound sessions
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    type Session: Session;

    async fn accept(&self) -> Result<Self::Session, TunnelError>;
}
