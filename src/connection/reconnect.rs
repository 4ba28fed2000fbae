// ABOUTME: Reconnection strategies and backoff delay computation
// Shared channels retry forever with a capped delay; isolated ones give up

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff policy for one connection category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectStrategy {
    /// `None` retries indefinitely.
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub connect_timeout_ms: u64,
}

impl ReconnectStrategy {
    /// Shared broadcast channels are essential infrastructure: unbounded
    /// retries with a capped delay.
    pub fn shared() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: 3_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 1.5,
            jitter: true,
            connect_timeout_ms: 10_000,
        }
    }

    /// Terminal-style connections retry a bounded number of times, then the
    /// session requires a manual reconnect.
    pub fn terminal() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 1.2,
            jitter: false,
            connect_timeout_ms: 5_000,
        }
    }

    pub fn default_policy() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay_ms: 2_000,
            max_delay_ms: 20_000,
            backoff_multiplier: 1.5,
            jitter: true,
            connect_timeout_ms: 10_000,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Delay before attempt number `attempt` (0-based):
    /// `min(max_delay, initial × multiplier^attempt)`, scaled into the
    /// 0.5–1.0 range when jitter is on.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.min(32) as i32);
        let mut delay = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);

        if self.jitter {
            delay *= rand::thread_rng().gen_range(0.5..1.0);
        }

        Duration::from_millis(delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically_until_capped() {
        let strategy = ReconnectStrategy {
            max_attempts: Some(10),
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: false,
            connect_timeout_ms: 1_000,
        };

        assert_eq!(strategy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(strategy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(strategy.delay_for(2), Duration::from_millis(4_000));
        // Capped from here on
        assert_eq!(strategy.delay_for(3), Duration::from_millis(5_000));
        assert_eq!(strategy.delay_for(9), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let strategy = ReconnectStrategy {
            jitter: true,
            ..ReconnectStrategy::shared()
        };

        for attempt in 0..6 {
            let exact = (strategy.initial_delay_ms as f64
                * strategy.backoff_multiplier.powi(attempt))
            .min(strategy.max_delay_ms as f64);
            let delay = strategy.delay_for(attempt as u32).as_millis() as f64;
            assert!(delay >= exact * 0.5 - 1.0, "attempt {attempt}: {delay} too small");
            assert!(delay <= exact + 1.0, "attempt {attempt}: {delay} too large");
        }
    }

    #[test]
    fn bounded_strategy_exhausts() {
        let strategy = ReconnectStrategy::terminal();
        assert!(strategy.allows_attempt(0));
        assert!(strategy.allows_attempt(4));
        assert!(!strategy.allows_attempt(5));
    }

    #[test]
    fn unbounded_strategy_never_exhausts() {
        let strategy = ReconnectStrategy::shared();
        assert!(strategy.allows_attempt(10_000));
    }
}
