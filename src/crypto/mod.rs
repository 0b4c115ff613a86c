//! Cryptographic primitives for AetherTunnel
//!
//! This module provides:
//! - Ed25519 signing/verification for logins and work connections
//! - HMAC-SHA256 for heartbeats
//! - HKDF-SHA256 key derivation
//! - ChaCha20-Poly1305 AEAD record envelope for the data plane
//! - Constant-time comparison and secure randomness

mod envelope;
mod kdf;
mod signing;

pub use envelope::{Envelope, SealedStream, MAX_RECORD_SIZE};
pub use kdf::{derive_data_keys, derive_heartbeat_key, derive_session_key};
pub use signing::{Ed25519Verifier, HmacSigner, KeyPair};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of AEAD authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),
}

/// Fill a buffer with cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system RNG failure");
}

/// Generate a random 128-bit identifier rendered as lowercase hex.
pub fn random_hex_id() -> String {
    use std::fmt::Write;

    let mut raw = [0u8; 16];
    random_bytes(&mut raw);

    let mut out = String::with_capacity(32);
    for byte in raw {
        write!(out, "{:02x}", byte).expect("write to string");
    }
    out
}

/// Current unix time in seconds, the clock all signed timestamps use.
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, data)
        .as_ref()
        .to_vec()
}

/// Constant-time equality for tokens, MACs, and signatures.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_random_hex_id_shape() {
        let id = random_hex_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_hex_id());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string
        let digest = sha256(b"");
        assert_eq!(
            digest[..4],
            [0xe3, 0xb0, 0xc4, 0x42],
        );
    }
}
