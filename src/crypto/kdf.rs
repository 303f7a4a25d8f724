//! Key Derivation Functions
//!
//! The tunnel key is stretched from the pre-shared secret with
//! PBKDF2-HMAC-SHA1. Both ends derive it independently, so the secret and
//! salt have to be distributed out of band.

use super::KEY_LEN;
use ring::pbkdf2;
use std::num::NonZeroU32;

/// Fixed PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 4096;

const ITERATIONS: NonZeroU32 = match NonZeroU32::new(PBKDF2_ITERATIONS) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

/// Derive the 32-byte channel key from `secret` and `salt`
///
/// Pure and deterministic: identical inputs always yield identical keys.
pub fn derive_key(secret: &str, salt: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA1,
        ITERATIONS,
        salt.as_bytes(),
        secret.as_bytes(),
        &mut key,
    );
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let a = derive_key("1024", "kcp-go");
        let b = derive_key("1024", "kcp-go");
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_key_distinct_inputs() {
        let base = derive_key("1024", "kcp-go");
        assert_ne!(base, derive_key("1025", "kcp-go"));
        assert_ne!(base, derive_key("1024", "kcp-go2"));
        assert_ne!(derive_key("ab", "c"), derive_key("a", "bc"));
    }

    #[test]
    fn test_rfc6070_vector() {
        // P = "password", S = "salt", c = 4096; the first block is the 20-byte output
        let expected: [u8; 20] = [
            0x4b, 0x00, 0x79, 0x01, 0xb7, 0x65, 0x48, 0x9a, 0xbe, 0xad, 0x49, 0xd9, 0x26, 0xf7,
            0x21, 0xd0, 0x65, 0xa4, 0x29, 0xc1,
        ];
        let key = derive_key("password", "salt");
        assert_eq!(&key[..20], &expected);
    }
}
