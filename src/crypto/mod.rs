//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - PBKDF2-HMAC-SHA1 derivation of the pre-shared session key
//! - Per-datagram AEAD (AES-256-GCM or ChaCha20-Poly1305)
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::PacketCipher;
pub use kdf::{derive_key, PBKDF2_ITERATIONS};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Random generation failed")]
    Random,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Packet too short: {0} bytes")]
    Truncated(usize),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Authentication failed")]
    AuthenticationFailed,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Random)
}

/// Random 32-bit value, used for conversation ids
pub fn random_u32() -> Result<u32, CryptoError> {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }
}
