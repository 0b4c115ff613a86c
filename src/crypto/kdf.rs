//! Key schedule
//!
//! Every symmetric key in the system is expanded from the shared token
//! with HKDF-SHA256 under a distinct info string: the heartbeat HMAC
//! subkey, the per-proxy data-plane envelope keys (one per direction),
//! and the session binding key.

use super::KEY_LEN;
use ring::hkdf::{Salt, HKDF_SHA256};

/// One extract-and-expand to a 32-byte key. HKDF_SHA256 doubles as the
/// output-length marker, so expansion to the digest size cannot fail.
fn expand_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; KEY_LEN] {
    let prk = Salt::new(HKDF_SHA256, salt).extract(ikm);
    let info_parts = [info];
    let okm = prk
        .expand(&info_parts, HKDF_SHA256)
        .expect("hkdf expand to digest size");

    let mut key = [0u8; KEY_LEN];
    okm.fill(&mut key).expect("hkdf fill to digest size");
    key
}

/// Derive the heartbeat HMAC subkey from the shared token.
pub fn derive_heartbeat_key(token: &str) -> [u8; KEY_LEN] {
    expand_key(token.as_bytes(), b"", b"aethertunnel/heartbeat")
}

/// Derive the pair of data-plane envelope keys for one proxy.
///
/// Both sides compute the same schedule from the shared token, the session
/// run id (salt), and the proxy name. The first key seals client-to-server
/// records, the second server-to-client.
pub fn derive_data_keys(
    token: &str,
    run_id: &str,
    proxy_name: &str,
) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let c2s = expand_key(
        token.as_bytes(),
        run_id.as_bytes(),
        format!("aethertunnel/data/{}/c2s", proxy_name).as_bytes(),
    );
    let s2c = expand_key(
        token.as_bytes(),
        run_id.as_bytes(),
        format!("aethertunnel/data/{}/s2c", proxy_name).as_bytes(),
    );
    (c2s, s2c)
}

/// Derive a key binding a session to the client's public key, for use by
/// collaborators that configure an encrypted control envelope.
pub fn derive_session_key(token: &str, client_public_key: &[u8]) -> [u8; KEY_LEN] {
    expand_key(
        token.as_bytes(),
        client_public_key,
        b"aethertunnel/session",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_separates_keys() {
        let a = expand_key(b"token", b"", b"aethertunnel/a");
        let b = expand_key(b"token", b"", b"aethertunnel/b");
        assert_ne!(a, b);
        assert_eq!(a, expand_key(b"token", b"", b"aethertunnel/a"));
    }

    #[test]
    fn test_salt_separates_keys() {
        let a = expand_key(b"token", b"run-1", b"aethertunnel/data");
        let b = expand_key(b"token", b"run-2", b"aethertunnel/data");
        assert_ne!(a, b);
    }

    #[test]
    fn test_data_keys_direction_and_proxy_separation() {
        let (c2s, s2c) = derive_data_keys("token", "runid", "ssh");
        assert_ne!(c2s, s2c);

        let (other_c2s, _) = derive_data_keys("token", "runid", "web");
        assert_ne!(c2s, other_c2s);

        let (same_c2s, same_s2c) = derive_data_keys("token", "runid", "ssh");
        assert_eq!(c2s, same_c2s);
        assert_eq!(s2c, same_s2c);
    }

    #[test]
    fn test_heartbeat_key_differs_from_token() {
        let key = derive_heartbeat_key("token");
        assert_ne!(&key[..5], b"token");
        assert_eq!(key, derive_heartbeat_key("token"));
    }

    #[test]
    fn test_session_key_binds_public_key() {
        let a = derive_session_key("token", b"public-key-a");
        let b = derive_session_key("token", b"public-key-b");
        assert_ne!(a, b);
    }
}
