//! Datagram encryption
//!
//! Every UDP payload is sealed independently:
//!
//! ```text
//! +----------------+------------------------+-----------+
//! |  Nonce (12B)   |      Ciphertext        | Tag (16B) |
//! +----------------+------------------------+-----------+
//! ```
//!
//! Nonces are random because datagrams can be lost, duplicated or
//! reordered, so no counter can be kept in sync between the peers.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::config::CipherKind;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};

/// Stateless per-packet cipher, shared between the send and receive paths
pub struct PacketCipher {
    key: Option<LessSafeKey>,
}

impl PacketCipher {
    /// Create a cipher from a 32-byte key
    pub fn new(kind: CipherKind, key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let algorithm = match kind {
            CipherKind::Aes => &AES_256_GCM,
            CipherKind::Chacha20 => &CHACHA20_POLY1305,
            CipherKind::None => return Ok(Self { key: None }),
        };
        let unbound_key =
            UnboundKey::new(algorithm, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: Some(LessSafeKey::new(unbound_key)),
        })
    }

    /// Bytes added to every datagram
    pub fn overhead(&self) -> usize {
        if self.key.is_some() {
            NONCE_LEN + TAG_LEN
        } else {
            0
        }
    }

    /// Seal `plaintext` into a new datagram
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };

        let mut packet = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce)?;
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(plaintext);

        let tag = key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut packet[NONCE_LEN..],
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        packet.extend_from_slice(tag.as_ref());

        Ok(packet)
    }

    /// Verify and decrypt a datagram in place, returning the plaintext
    pub fn open<'a>(&self, packet: &'a mut [u8]) -> Result<&'a [u8], CryptoError> {
        let Some(key) = &self.key else {
            return Ok(&*packet);
        };

        if packet.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(packet.len()));
        }

        let (nonce, sealed) = packet.split_at_mut(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce).map_err(|_| CryptoError::AuthenticationFailed)?;

        let plaintext = key
            .open_in_place(nonce, Aad::empty(), sealed)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        Ok(&*plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [0x42u8; KEY_LEN];
        let cipher = PacketCipher::new(CipherKind::Aes, &key).unwrap();

        let mut packet = cipher.seal(b"Hello, World!").unwrap();
        assert_eq!(packet.len(), 13 + cipher.overhead());

        let plaintext = cipher.open(&mut packet).unwrap();
        assert_eq!(plaintext, b"Hello, World!");
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = PacketCipher::new(CipherKind::Chacha20, &[7u8; KEY_LEN]).unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = PacketCipher::new(CipherKind::Aes, &[0x42u8; KEY_LEN]).unwrap();
        let mut packet = cipher.seal(b"Hello, World!").unwrap();

        // Tamper with ciphertext
        packet[NONCE_LEN] ^= 0xFF;
        assert!(cipher.open(&mut packet).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sender = PacketCipher::new(CipherKind::Aes, &[1u8; KEY_LEN]).unwrap();
        let receiver = PacketCipher::new(CipherKind::Aes, &[2u8; KEY_LEN]).unwrap();
        let mut packet = sender.seal(b"secret").unwrap();
        assert!(matches!(
            receiver.open(&mut packet),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_short_packet_rejected() {
        let cipher = PacketCipher::new(CipherKind::Aes, &[1u8; KEY_LEN]).unwrap();
        let mut packet = [0u8; 10];
        assert!(matches!(
            cipher.open(&mut packet),
            Err(CryptoError::Truncated(10))
        ));
    }

    #[test]
    fn test_none_is_passthrough() {
        let cipher = PacketCipher::new(CipherKind::None, &[0u8; KEY_LEN]).unwrap();
        assert_eq!(cipher.overhead(), 0);
        let mut packet = cipher.seal(b"plain").unwrap();
        assert_eq!(cipher.open(&mut packet).unwrap(), b"plain");
    }
}
