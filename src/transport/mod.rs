//! Reliable UDP transport
//!
//! Provides the packet path the tunnel runs on:
//! - KCP retransmission (the `kcp` crate) driven by a tokio task
//! - Reed-Solomon forward error correction
//! - Per-datagram AEAD encryption
//! - Optional snappy stream compression
//! - A demultiplexing listener and an ephemeral-socket dialer

mod comp;
mod conn;
pub mod fec;
mod listener;
mod socket;
pub mod stats;
mod tcp;

pub use comp::CompStream;
pub use conn::{dial, ReliableConn};
pub use listener::ReliableListener;
pub use stats::{StatsSnapshot, TransportStats};
pub use tcp::connect_timeout;

use crate::crypto::CryptoError;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("FEC error: {0}")]
    Fec(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}
