//! Authentication and anti-abuse
//!
//! Login verification (token, timestamp replay window, Ed25519 signature
//! with HMAC fallback), the per-client connection limiter, and the IP
//! block-list with TTL.

mod blocklist;
mod limiter;

pub use blocklist::IpBlocker;
pub use limiter::ConnectionLimiter;

use crate::crypto::{constant_time_eq, sha256, Ed25519Verifier, HmacSigner};
use crate::protocol::Login;
use std::collections::HashSet;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("InvalidToken")]
    InvalidToken,

    #[error("InvalidTimestamp")]
    InvalidTimestamp,

    #[error("InvalidSignature")]
    InvalidSignature,

    #[error("ConnectionLimit")]
    ConnectionLimit,

    #[error("Blocked")]
    Blocked,

    #[error("NotWhitelisted")]
    NotWhitelisted,
}

/// Verifies Login messages against the configured token and clock.
pub struct LoginVerifier {
    token_hash: Vec<u8>,
    grace_secs: i64,
    /// Raw-token HMAC, the fallback when a login carries no key pair.
    hmac: HmacSigner,
    /// Non-empty enables strict mode: the login public key must be listed.
    registered_keys: HashSet<Vec<u8>>,
}

impl LoginVerifier {
    /// Create a verifier for the shared token with the given grace window.
    pub fn new(token: &str, grace_secs: u64) -> Self {
        Self {
            token_hash: sha256(token.as_bytes()),
            grace_secs: grace_secs as i64,
            hmac: HmacSigner::new(token.as_bytes()),
            registered_keys: HashSet::new(),
        }
    }

    /// Enable strict mode: only the listed Ed25519 public keys may log in.
    pub fn with_registered_keys(mut self, keys: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.registered_keys = keys.into_iter().collect();
        self
    }

    /// Constant-time token check.
    pub fn verify_token(&self, token: &str) -> bool {
        constant_time_eq(&self.token_hash, &sha256(token.as_bytes()))
    }

    /// Whether `timestamp` lies within the grace window around `now`.
    pub fn timestamp_in_grace(&self, timestamp: i64, now: i64) -> bool {
        (timestamp - now).abs() <= self.grace_secs
    }

    /// Full login verification: token, replay window, then signature.
    pub fn verify_login(&self, login: &Login, now: i64) -> Result<(), AuthError> {
        if !self.verify_token(&login.token) {
            return Err(AuthError::InvalidToken);
        }

        if !self.timestamp_in_grace(login.timestamp, now) {
            return Err(AuthError::InvalidTimestamp);
        }

        if !login.public_key.is_empty() {
            if !self.registered_keys.is_empty() && !self.registered_keys.contains(&login.public_key)
            {
                return Err(AuthError::InvalidSignature);
            }
            let verifier = Ed25519Verifier::new(&login.public_key)
                .map_err(|_| AuthError::InvalidSignature)?;
            if !verifier.verify_timestamp(login.timestamp, &login.signature) {
                return Err(AuthError::InvalidSignature);
            }
        } else if !self.hmac.verify_timestamp(login.timestamp, &login.signature) {
            return Err(AuthError::InvalidSignature);
        }

        Ok(())
    }
}

/// Hide the middle of a token for logging.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "****".to_string();
    }
    format!("{}****{}", &token[..4], &token[token.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn login_with_keypair(token: &str, timestamp: i64, kp: &KeyPair) -> Login {
        Login {
            token: token.to_string(),
            timestamp,
            signature: kp.sign_timestamp(timestamp),
            public_key: kp.public_key(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_login() {
        let verifier = LoginVerifier::new("secret", 30);
        let kp = KeyPair::generate().unwrap();
        let now = 1_700_000_000;

        let login = login_with_keypair("secret", now, &kp);
        assert_eq!(verifier.verify_login(&login, now), Ok(()));
    }

    #[test]
    fn test_wrong_token() {
        let verifier = LoginVerifier::new("secret", 30);
        let kp = KeyPair::generate().unwrap();
        let now = 1_700_000_000;

        let login = login_with_keypair("guess", now, &kp);
        assert_eq!(
            verifier.verify_login(&login, now),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_timestamp_outside_grace() {
        let verifier = LoginVerifier::new("secret", 30);
        let kp = KeyPair::generate().unwrap();
        let now = 1_700_000_000;

        // 120 seconds stale with a 30 second grace
        let login = login_with_keypair("secret", now - 120, &kp);
        assert_eq!(
            verifier.verify_login(&login, now),
            Err(AuthError::InvalidTimestamp)
        );

        // Future timestamps are equally rejected
        let login = login_with_keypair("secret", now + 120, &kp);
        assert_eq!(
            verifier.verify_login(&login, now),
            Err(AuthError::InvalidTimestamp)
        );
    }

    #[test]
    fn test_replay_within_grace_accepted() {
        // Signatures are not one-shot; the same timestamp within grace
        // verifies twice
        let verifier = LoginVerifier::new("secret", 30);
        let kp = KeyPair::generate().unwrap();
        let now = 1_700_000_000;

        let login = login_with_keypair("secret", now - 10, &kp);
        assert_eq!(verifier.verify_login(&login, now), Ok(()));
        assert_eq!(verifier.verify_login(&login, now), Ok(()));
    }

    #[test]
    fn test_signature_over_wrong_timestamp() {
        let verifier = LoginVerifier::new("secret", 30);
        let kp = KeyPair::generate().unwrap();
        let now = 1_700_000_000;

        let mut login = login_with_keypair("secret", now, &kp);
        login.signature = kp.sign_timestamp(now - 1);
        assert_eq!(
            verifier.verify_login(&login, now),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_hmac_fallback_without_keypair() {
        let verifier = LoginVerifier::new("secret", 30);
        let hmac = HmacSigner::new(b"secret");
        let now = 1_700_000_000;

        let login = Login {
            token: "secret".into(),
            timestamp: now,
            signature: hmac.sign_timestamp(now),
            public_key: Vec::new(),
            ..Default::default()
        };
        assert_eq!(verifier.verify_login(&login, now), Ok(()));

        let forged = Login {
            signature: HmacSigner::new(b"other").sign_timestamp(now),
            ..login
        };
        assert_eq!(
            verifier.verify_login(&forged, now),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_strict_mode_requires_registered_key() {
        let trusted = KeyPair::generate().unwrap();
        let stranger = KeyPair::generate().unwrap();
        let verifier =
            LoginVerifier::new("secret", 30).with_registered_keys([trusted.public_key()]);
        let now = 1_700_000_000;

        let login = login_with_keypair("secret", now, &trusted);
        assert_eq!(verifier.verify_login(&login, now), Ok(()));

        let login = login_with_keypair("secret", now, &stranger);
        assert_eq!(
            verifier.verify_login(&login, now),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("short"), "****");
        assert_eq!(mask_token("supersecrettoken"), "supe****oken");
    }
}
