//! Per-client connection limiter

use super::AuthError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Bounds the number of concurrent control sessions per client id.
///
/// A limit of 0 disables the bound. A failed increment records nothing, so
/// rejected attempts never consume budget.
pub struct ConnectionLimiter {
    max_per_client: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl ConnectionLimiter {
    /// Create with the given per-client bound (0 = unlimited).
    pub fn new(max_per_client: u32) -> Self {
        Self {
            max_per_client,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Claim one slot for `client_id`.
    pub fn increment(&self, client_id: &str) -> Result<(), AuthError> {
        let mut counts = self.counts.lock().expect("limiter lock");
        let count = counts.entry(client_id.to_string()).or_insert(0);
        if self.max_per_client > 0 && *count >= self.max_per_client {
            return Err(AuthError::ConnectionLimit);
        }
        *count += 1;
        Ok(())
    }

    /// Release one slot for `client_id`.
    pub fn decrement(&self, client_id: &str) {
        let mut counts = self.counts.lock().expect("limiter lock");
        if let Some(count) = counts.get_mut(client_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(client_id);
            }
        }
    }

    /// Current count for `client_id`.
    pub fn count(&self, client_id: &str) -> u32 {
        self.counts
            .lock()
            .expect("limiter lock")
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced() {
        let limiter = ConnectionLimiter::new(2);
        limiter.increment("a").unwrap();
        limiter.increment("a").unwrap();
        assert_eq!(limiter.increment("a"), Err(AuthError::ConnectionLimit));

        // The failed attempt did not consume budget
        assert_eq!(limiter.count("a"), 2);

        // Other clients are unaffected
        limiter.increment("b").unwrap();
    }

    #[test]
    fn test_decrement_frees_slot() {
        let limiter = ConnectionLimiter::new(1);
        limiter.increment("a").unwrap();
        assert!(limiter.increment("a").is_err());

        limiter.decrement("a");
        limiter.increment("a").unwrap();
    }

    #[test]
    fn test_zero_means_unlimited() {
        let limiter = ConnectionLimiter::new(0);
        for _ in 0..1000 {
            limiter.increment("a").unwrap();
        }
        assert_eq!(limiter.count("a"), 1000);
    }

    #[test]
    fn test_decrement_unknown_is_noop() {
        let limiter = ConnectionLimiter::new(1);
        limiter.decrement("ghost");
        assert_eq!(limiter.count("ghost"), 0);
    }
}
