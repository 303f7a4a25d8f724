//! # sskcp
//!
//! A TCP tunnel over encrypted, forward-error-corrected reliable UDP.
//!
//! The client accepts plain TCP connections and carries each one as a
//! virtual stream inside a pool of multiplexed sessions. The server accepts
//! those sessions and connects every stream to a fixed TCP target.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Client / Server accept loops            │
//! │          (session pool, scavenger, relay)            │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │        (virtual streams, receive budget, NOP)        │
//! ├─────────────────────────────────────────────────────┤
//! │                   Reliable Layer                     │
//! │   (KCP retransmission, Reed-Solomon FEC, snappy)     │
//! ├─────────────────────────────────────────────────────┤
//! │                   Packet Crypto                      │
//! │      (PBKDF2 key, AES-256-GCM / ChaCha20-Poly1305)   │
//! ├─────────────────────────────────────────────────────┤
//! │                        UDP                           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod pool;
pub mod relay;
pub mod server;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from loading and checking configuration
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
