//! Retry schedule for failed uploads.
//!
//! Uploads are retried on a fixed, escalating schedule rather than pure
//! exponential backoff. Each delay gets a small random jitter so that workers
//! which failed together do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Nominal delays between attempts (in milliseconds).
const DEFAULT_DELAYS_MS: [u64; 4] = [2_000, 3_000, 5_000, 8_000];

/// Upper bound (exclusive) of the jitter added to each delay (in milliseconds).
const DEFAULT_JITTER_MS: u64 = 50;

/// Decides whether and when a failed upload is attempted again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before retry `n` is `delays[n - 1]`
    delays: Vec<Duration>,

    /// Upper bound (exclusive) of the uniform jitter added to each delay
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: DEFAULT_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            jitter: Duration::from_millis(DEFAULT_JITTER_MS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a custom schedule.
    ///
    /// The number of retries equals `delays.len()`; an empty schedule never retries.
    pub fn new(delays: Vec<Duration>, jitter: Duration) -> Self {
        Self { delays, jitter }
    }

    /// Delay to wait before retry number `retry` (1-based), jitter included.
    ///
    /// Returns `None` when the retry budget is exhausted.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        let index = usize::try_from(retry).ok()?.checked_sub(1)?;
        let base = *self.delays.get(index)?;
        Some(base + random_jitter(self.jitter))
    }

    /// Number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.delays.len() as u32
    }

    /// The nominal schedule, without jitter.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }
}

/// Uniform random duration in `[0, bound)`. A zero bound yields zero.
pub(crate) fn random_jitter(bound: Duration) -> Duration {
    let bound_ms = bound.as_millis() as u64;
    if bound_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..bound_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 4);
        assert_eq!(
            policy.delays(),
            &[
                Duration::from_millis(2000),
                Duration::from_millis(3000),
                Duration::from_millis(5000),
                Duration::from_millis(8000),
            ]
        );
        assert_eq!(policy.jitter(), Duration::from_millis(50));
    }

    #[test]
    fn test_delays_stay_within_jitter_bounds() {
        let policy = RetryPolicy::default();

        for _ in 0..100 {
            for (retry, nominal) in [(1, 2000), (2, 3000), (3, 5000), (4, 8000)] {
                let delay = policy.delay_for(retry).expect("retry within budget");
                assert!(delay >= Duration::from_millis(nominal));
                assert!(delay < Duration::from_millis(nominal + 50));
            }
        }
    }

    #[test]
    fn test_exhausted_after_schedule() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(5).is_none());
        assert!(policy.delay_for(100).is_none());
    }

    #[test]
    fn test_retry_zero_is_not_a_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(0).is_none());
    }

    #[test]
    fn test_custom_schedule_without_jitter() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(10)], Duration::ZERO);
        assert_eq!(policy.max_retries(), 1);
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_for(2), None);
    }

    #[test]
    fn test_empty_schedule_never_retries() {
        let policy = RetryPolicy::new(Vec::new(), Duration::from_millis(50));
        assert_eq!(policy.max_retries(), 0);
        assert!(policy.delay_for(1).is_none());
    }

    #[test]
    fn test_random_jitter_zero_bound() {
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
    }
}
