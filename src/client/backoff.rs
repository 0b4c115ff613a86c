//! Reconnect backoff strategies

use crate::config::ReconnectConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Fixed,
    Linear,
    Exponential,
}

/// Produces the delay before each reconnect attempt.
///
/// `fixed` always sleeps the base delay, `linear` multiplies it by the
/// attempt number, `exponential` doubles it, all capped at the configured
/// ceiling and multiplied by a uniform jitter factor in `[1-j, 1+j]`.
pub struct Backoff {
    strategy: Strategy,
    base: Duration,
    max_delay: Duration,
    jitter: f64,
    max_attempts: i64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let strategy = match config.strategy.as_str() {
            "fixed" => Strategy::Fixed,
            "linear" => Strategy::Linear,
            _ => Strategy::Exponential,
        };
        Self {
            strategy,
            base: Duration::from_secs(config.base_delay.max(1)),
            max_delay: Duration::from_secs(config.max_delay.max(1)),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or None once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts >= 0 && i64::from(self.attempt) >= self.max_attempts {
            return None;
        }
        self.attempt += 1;

        let raw = match self.strategy {
            Strategy::Fixed => self.base,
            Strategy::Linear => self.base.saturating_mul(self.attempt),
            Strategy::Exponential => {
                let doublings = (self.attempt - 1).min(16);
                self.base.saturating_mul(1u32 << doublings)
            }
        };

        let capped = raw.min(self.max_delay);
        Some(capped.mul_f64(jitter_factor(self.jitter)))
    }

    /// Forget past failures after a successful login.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

fn jitter_factor(jitter: f64) -> f64 {
    if jitter == 0.0 {
        return 1.0;
    }
    let mut raw = [0u8; 8];
    crate::crypto::random_bytes(&mut raw);
    let unit = u64::from_le_bytes(raw) as f64 / u64::MAX as f64;
    1.0 - jitter + 2.0 * jitter * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: &str, max_attempts: i64) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            strategy: strategy.to_string(),
            max_attempts,
            jitter: 0.0,
            base_delay: 1,
            max_delay: 60,
        }
    }

    #[test]
    fn test_fixed_strategy() {
        let mut backoff = Backoff::new(&config("fixed", -1));
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        }
    }

    #[test]
    fn test_linear_strategy() {
        let mut backoff = Backoff::new(&config("linear", -1));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_exponential_strategy_caps_at_max() {
        let mut backoff = Backoff::new(&config("exponential", -1));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));

        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_max_attempts_exhausts() {
        let mut backoff = Backoff::new(&config("fixed", 2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut cfg = config("fixed", -1);
        cfg.jitter = 0.2;
        cfg.base_delay = 10;
        let mut backoff = Backoff::new(&cfg);

        for _ in 0..50 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_secs(8), "{:?}", delay);
            assert!(delay <= Duration::from_secs(12), "{:?}", delay);
        }
    }
}
