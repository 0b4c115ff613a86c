//! Token-bucket byte-rate limiter
//!
//! One instance per splice direction; the two directions of a capped proxy
//! are limited independently. The bucket never buffers data, it only delays
//! the copy loop, so TCP flow control remains the backpressure mechanism.

use std::time::Instant;
use tokio::time::{sleep, Duration};

/// Token bucket over bytes per second.
pub struct RateLimiter {
    bytes_per_sec: u64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter for `bytes_per_sec`; 0 disables limiting.
    ///
    /// Burst is a quarter second of traffic, floored at one copy buffer so
    /// a single full chunk can always pass.
    pub fn new(bytes_per_sec: u64) -> Self {
        let burst = ((bytes_per_sec as f64) * 0.25).max(super::pool::BUFFER_SIZE as f64);
        Self {
            bytes_per_sec,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    /// Wait until `n` bytes may pass.
    pub async fn acquire(&mut self, n: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }

        self.refill();
        let needed = n as f64;
        if self.tokens < needed {
            let deficit = needed - self.tokens;
            let wait = deficit / self.bytes_per_sec as f64;
            sleep(Duration::from_secs_f64(wait)).await;
            self.refill();
        }

        self.tokens = (self.tokens - needed).max(0.0);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.bytes_per_sec as f64).min(self.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let mut limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(1 << 20).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_rate_is_enforced() {
        // 256 KiB/s with 64 KiB burst: moving 256 KiB beyond the burst
        // should take roughly a second
        let mut limiter = RateLimiter::new(256 * 1024);
        let start = Instant::now();
        let mut moved = 0usize;
        while moved < 320 * 1024 {
            limiter.acquire(32 * 1024).await;
            moved += 32 * 1024;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_burst_allows_first_chunk() {
        // Even a tiny rate admits one full copy buffer immediately
        let mut limiter = RateLimiter::new(1024);
        let start = Instant::now();
        limiter.acquire(super::super::pool::BUFFER_SIZE).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
