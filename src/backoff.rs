//! Retry schedule for failed pushes.
//!
//! The delay starts at the minimum period, doubles after every failed
//! attempt and is capped at the maximum period. There is no jitter: the
//! same policy always produces the same schedule. With the defaults the
//! waits are 0.5s, 1s, 2s, ... 128s across ten attempts.

use std::time::Duration;

/// Default initial wait between attempts
pub const DEFAULT_MIN_PERIOD: Duration = Duration::from_millis(500);

/// Default ceiling for the wait between attempts
pub const DEFAULT_MAX_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Default number of attempts before a batch is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Bounds of the retry schedule.
///
/// `max_retries == 0` means attempts never stop on their own; only a
/// shutdown ends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min_period: Duration,
    pub max_period: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_period: DEFAULT_MIN_PERIOD,
            max_period: DEFAULT_MAX_PERIOD,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl BackoffPolicy {
    /// Build a policy, raising `max_period` to `min_period` if needed so the
    /// bounds stay ordered.
    pub fn new(min_period: Duration, max_period: Duration, max_retries: u32) -> Self {
        Self {
            min_period,
            max_period: max_period.max(min_period),
            max_retries,
        }
    }

    /// Start a fresh schedule for one batch.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            failures: 0,
            next_delay: self.min_period,
        }
    }
}

/// Retry state for a single batch.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    next_delay: Duration,
}

impl Backoff {
    /// Record a failed attempt.
    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Whether another attempt is allowed.
    pub fn ongoing(&self) -> bool {
        self.policy.max_retries == 0 || self.failures < self.policy.max_retries
    }

    /// The wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_delay;
        self.next_delay = self
            .next_delay
            .saturating_mul(2)
            .min(self.policy.max_period);
        delay
    }

    /// Number of failed attempts so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
