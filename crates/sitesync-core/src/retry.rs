//! Retry policy: attempt budget and jittered exponential backoff.
//!
//! Two layers of retry exist:
//!
//! - **Attempts.** A failed attempt for an (event, site) pair schedules the
//!   next one after `uniform(0, base_delays[attempt - 1])` (full jitter).
//! - **Connection sub-retries.** Inside one attempt, timeouts and refused
//!   connections are retried a few times after `uniform(0, base × 2^n)`
//!   before the attempt is counted as failed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::event::DEFAULT_MAX_RETRIES;

/// Default base delays in seconds, indexed by attempt number minus one.
pub const DEFAULT_BASE_DELAYS_SECS: [u64; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// Retry configuration shared by the dispatcher and the retry worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum delivery attempts per (event, site).
    pub max_retries: u32,
    /// Backoff bases per attempt. Attempts past the end reuse the last entry.
    pub base_delays: Vec<Duration>,
    /// Fast retries of connection-level failures within one attempt.
    pub connect_retries: u32,
    /// Base for connection sub-retry backoff.
    pub connect_retry_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delays: DEFAULT_BASE_DELAYS_SECS
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            connect_retries: 3,
            connect_retry_base: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Backoff base after attempt `attempt` (1-based) fails.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.base_delays
            .get(idx)
            .or_else(|| self.base_delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Jittered delay after attempt `attempt` fails.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        full_jitter(self.base_delay(attempt), rng)
    }

    /// Due time of the attempt following `attempt`.
    pub fn next_retry_at<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> DateTime<Utc> {
        let delay = self.delay(attempt, rng);
        now + chrono::Duration::milliseconds(delay.as_millis() as i64)
    }

    /// Whether another attempt may follow `attempts_made` attempts.
    pub fn can_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_retries
    }

    /// Jittered pause before connection sub-retry `n` (0-based).
    pub fn connect_backoff<R: Rng + ?Sized>(&self, n: u32, rng: &mut R) -> Duration {
        let base = self.connect_retry_base.saturating_mul(1u32 << n.min(16));
        full_jitter(base, rng)
    }
}

/// Uniform delay in `[0, base]`.
fn full_jitter<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let max_ms = base.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_base_delay_progression() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(8), Duration::from_secs(128));
        assert_eq!(policy.base_delay(20), Duration::from_secs(128));
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn test_bases_non_decreasing() {
        let policy = RetryPolicy::default();
        for pair in policy.base_delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.can_retry(7));
        assert!(!policy.can_retry(8));
    }

    #[test]
    fn test_zero_base_disables_connect_backoff() {
        let policy = RetryPolicy {
            connect_retry_base: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(policy.connect_backoff(2, &mut rng), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(seed in any::<u64>(), attempt in 1u32..12) {
            let policy = RetryPolicy::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy.delay(attempt, &mut rng);
            prop_assert!(delay <= policy.base_delay(attempt));
        }

        #[test]
        fn prop_next_retry_not_before_now(seed in any::<u64>(), attempt in 1u32..9) {
            let policy = RetryPolicy::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let now = Utc::now();
            let at = policy.next_retry_at(attempt, now, &mut rng);
            prop_assert!(at >= now);
            prop_assert!((at - now).num_milliseconds() as u128 <= policy.base_delay(attempt).as_millis());
        }

        #[test]
        fn prop_connect_backoff_bounded(seed in any::<u64>(), n in 0u32..3) {
            let policy = RetryPolicy::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let pause = policy.connect_backoff(n, &mut rng);
            prop_assert!(pause <= policy.connect_retry_base * (1 << n));
        }
    }
}
