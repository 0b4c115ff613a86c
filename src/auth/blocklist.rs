//! IP block-list with TTL

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Temporary IP blocks, typically applied after repeated auth failures.
///
/// `block` is idempotent: re-blocking keeps the later unblock time. Lookups
/// self-evict expired entries; a periodic [`IpBlocker::sweep`] bounds memory
/// for addresses that are never looked up again.
pub struct IpBlocker {
    blocked: Mutex<HashMap<IpAddr, Instant>>,
}

impl IpBlocker {
    pub fn new() -> Self {
        Self {
            blocked: Mutex::new(HashMap::new()),
        }
    }

    /// Block `ip` for `duration` from now, keeping any later existing block.
    pub fn block(&self, ip: IpAddr, duration: Duration) {
        let until = Instant::now() + duration;
        let mut blocked = self.blocked.lock().expect("blocklist lock");
        let entry = blocked.entry(ip).or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }

    /// Remove any block on `ip`.
    pub fn unblock(&self, ip: IpAddr) {
        self.blocked.lock().expect("blocklist lock").remove(&ip);
    }

    /// Whether `ip` is currently blocked. Expired entries are evicted.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let mut blocked = self.blocked.lock().expect("blocklist lock");
        match blocked.get(&ip) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                blocked.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// Drop all expired entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.blocked
            .lock()
            .expect("blocklist lock")
            .retain(|_, until| *until > now);
    }

    /// Number of tracked entries, expired or not.
    pub fn len(&self) -> usize {
        self.blocked.lock().expect("blocklist lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IpBlocker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_block_and_expire() {
        let blocker = IpBlocker::new();
        blocker.block(ip("203.0.113.9"), Duration::from_millis(30));
        assert!(blocker.is_blocked(ip("203.0.113.9")));
        assert!(!blocker.is_blocked(ip("203.0.113.10")));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocker.is_blocked(ip("203.0.113.9")));
        // Expired entry was evicted by the lookup
        assert!(blocker.is_empty());
    }

    #[test]
    fn test_reblock_keeps_later_unblock_time() {
        let blocker = IpBlocker::new();
        blocker.block(ip("203.0.113.9"), Duration::from_secs(60));
        // A shorter re-block must not shorten the sentence
        blocker.block(ip("203.0.113.9"), Duration::from_millis(1));

        std::thread::sleep(Duration::from_millis(10));
        assert!(blocker.is_blocked(ip("203.0.113.9")));

        // A longer re-block extends it
        blocker.block(ip("203.0.113.9"), Duration::from_secs(120));
        assert!(blocker.is_blocked(ip("203.0.113.9")));
    }

    #[test]
    fn test_sweep_bounds_memory() {
        let blocker = IpBlocker::new();
        for i in 0..100u8 {
            blocker.block(ip(&format!("10.0.0.{}", i)), Duration::from_millis(5));
        }
        assert_eq!(blocker.len(), 100);

        std::thread::sleep(Duration::from_millis(20));
        blocker.sweep();
        assert!(blocker.is_empty());
    }

    #[test]
    fn test_unblock() {
        let blocker = IpBlocker::new();
        blocker.block(ip("203.0.113.9"), Duration::from_secs(60));
        blocker.unblock(ip("203.0.113.9"));
        assert!(!blocker.is_blocked(ip("203.0.113.9")));
    }
}
