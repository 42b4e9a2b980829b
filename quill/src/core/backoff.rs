//! Bounded exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budgets and delays for backend calls (`[retry]` in config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries on the same credential after a rate-limit response.
    pub rate_limit_retries: u32,
    /// Retries after timeouts and other transient failures.
    pub transient_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_retries: 4,
            transient_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// `jitter_factor` is ignored unless jitter is enabled and must be in `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);
        let ms = if self.jitter {
            capped * (0.5 + jitter_factor.clamp(0.0, 1.0) * 0.5)
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn delays_grow_exponentially_until_capped() {
        let p = policy(false);
        let delays: Vec<u64> = (0..6)
            .map(|attempt| p.delay_for(attempt, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let p = policy(true);
        assert_eq!(p.delay_for(1, 0.0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, 0.999), Duration::from_millis(199));
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let p = policy(false);
        assert_eq!(p.delay_for(u32::MAX, 0.0), Duration::from_millis(1_000));
    }
}
