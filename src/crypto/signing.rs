//! Ed25519 and HMAC-SHA256 signers
//!
//! Logins and work connections carry Ed25519 signatures made with a
//! per-process client key pair; heartbeats use HMAC-SHA256 with a subkey
//! derived from the shared token. All verification is constant-time.

use super::{constant_time_eq, kdf, CryptoError};
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};
use std::fmt;

/// Ed25519 key pair, generated fresh per process start or loaded from
/// a base64-encoded PKCS#8 document.
pub struct KeyPair {
    pkcs8: Vec<u8>,
    key: Ed25519KeyPair,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let key = Ed25519KeyPair::from_pkcs8(doc.as_ref())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        Ok(Self {
            pkcs8: doc.as_ref().to_vec(),
            key,
        })
    }

    /// Load from a base64 PKCS#8 document previously produced by
    /// [`KeyPair::to_base64`].
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let pkcs8 = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        let key = Ed25519KeyPair::from_pkcs8(&pkcs8)
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        Ok(Self { pkcs8, key })
    }

    /// Encode the PKCS#8 document as base64 (keep this secret).
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.pkcs8)
    }

    /// Raw public key bytes (32 bytes).
    pub fn public_key(&self) -> Vec<u8> {
        self.key.public_key().as_ref().to_vec()
    }

    /// Sign arbitrary bytes.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.key.sign(data).as_ref().to_vec()
    }

    /// Sign the decimal rendering of a unix timestamp.
    pub fn sign_timestamp(&self, timestamp: i64) -> Vec<u8> {
        self.sign(timestamp.to_string().as_bytes())
    }

    /// Sign the canonical work-connection string `run_id:request_id:timestamp`.
    pub fn sign_work_conn(&self, run_id: &str, request_id: u64, timestamp: i64) -> Vec<u8> {
        self.sign(crate::protocol::NewWorkConn::signed_bytes(run_id, request_id, timestamp).as_slice())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair([REDACTED])")
    }
}

/// Ed25519 verifier built from raw public key bytes.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    public_key: Vec<u8>,
}

impl Ed25519Verifier {
    /// Create from raw public key bytes (32 bytes).
    pub fn new(public_key: &[u8]) -> Result<Self, CryptoError> {
        if public_key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength);
        }
        Ok(Self {
            public_key: public_key.to_vec(),
        })
    }

    /// Verify a signature over arbitrary bytes.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        signature::UnparsedPublicKey::new(&signature::ED25519, &self.public_key)
            .verify(data, sig)
            .is_ok()
    }

    /// Verify a signature over the decimal rendering of a timestamp.
    pub fn verify_timestamp(&self, timestamp: i64, sig: &[u8]) -> bool {
        self.verify(timestamp.to_string().as_bytes(), sig)
    }

    /// Verify the canonical work-connection signature.
    pub fn verify_work_conn(
        &self,
        run_id: &str,
        request_id: u64,
        timestamp: i64,
        sig: &[u8],
    ) -> bool {
        self.verify(
            crate::protocol::NewWorkConn::signed_bytes(run_id, request_id, timestamp).as_slice(),
            sig,
        )
    }
}

/// HMAC-SHA256 signer for heartbeats and the signature fallback path.
#[derive(Clone)]
pub struct HmacSigner {
    key: ring::hmac::Key,
}

impl HmacSigner {
    /// Create from raw key bytes.
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key),
        }
    }

    /// Create the heartbeat signer for a shared token, keyed by an
    /// HKDF-derived subkey rather than the raw token bytes.
    pub fn for_heartbeat(token: &str) -> Self {
        Self::new(&kdf::derive_heartbeat_key(token))
    }

    /// Sign arbitrary bytes.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        ring::hmac::sign(&self.key, data).as_ref().to_vec()
    }

    /// Sign the decimal rendering of a timestamp.
    pub fn sign_timestamp(&self, timestamp: i64) -> Vec<u8> {
        self.sign(timestamp.to_string().as_bytes())
    }

    /// Verify a tag over arbitrary bytes in constant time.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        constant_time_eq(&self.sign(data), tag)
    }

    /// Verify a tag over the decimal rendering of a timestamp.
    pub fn verify_timestamp(&self, timestamp: i64, tag: &[u8]) -> bool {
        self.verify(timestamp.to_string().as_bytes(), tag)
    }
}

impl fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HmacSigner([REDACTED])")
    }
}
