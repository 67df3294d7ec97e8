//! Retry backoff with full jitter.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
///
/// Delays use full jitter: uniform in `[0, min(cap, base * 2^attempt)]`.
/// Jitter spreads retry storms from many objects failing at once.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Ceiling of the first retry delay.
    pub base: Duration,

    /// Maximum delay ceiling.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let millis = rand::rng().random_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// The jitter-free ceiling for `attempt`.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self
            .base
            .as_millis()
            .saturating_mul(1u128 << exponent)
            .min(self.cap.as_millis());
        Duration::from_millis(scaled as u64)
    }
}

/// Tracks consecutive failures per key.
#[derive(Debug, Default)]
pub struct RetryTracker<K> {
    attempts: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> RetryTracker<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempts: HashMap::new(),
        }
    }

    /// Records a failure and returns the consecutive attempt count.
    pub fn record_failure(&mut self, key: &K) -> u32 {
        let count = self.attempts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Clears failure tracking for a key (on success).
    pub fn clear(&mut self, key: &K) {
        self.attempts.remove(key);
    }

    #[must_use]
    pub fn attempts(&self, key: &K) -> u32 {
        self.attempts.get(key).copied().unwrap_or(0)
    }
}
