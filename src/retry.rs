//! Bounded-attempt retry with exponential backoff.
//!
//! A [`Backoff`] owns its attempt counter, so a budget can be carried across
//! call sites (the CAPTCHA session keeps one alive across re-detections) and
//! inspected directly in tests.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy allowing one initial attempt plus `retries` more.
    pub fn with_retries(retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts: retries.saturating_add(1), base_delay, max_delay }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_retries(4, Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Reserves the next attempt. Returns its 1-based number, or `None` once
    /// the budget is spent.
    pub fn begin(&mut self) -> Option<u32> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Delay before the next attempt, or `None` if no attempt remains.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.is_exhausted() || self.attempts == 0 {
            return None;
        }
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn remaining(&self) -> u32 {
        self.policy.max_attempts.saturating_sub(self.attempts)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_is_capped() {
        let p = RetryPolicy::with_retries(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1000));
        assert_eq!(p.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn four_retries_allow_five_attempts() {
        let mut b = Backoff::new(RetryPolicy::with_retries(4, Duration::ZERO, Duration::ZERO));
        let mut seen = Vec::new();
        while let Some(n) = b.begin() {
            seen.push(n);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(b.is_exhausted());
        assert_eq!(b.next_delay(), None);
    }

    #[test]
    fn next_delay_follows_attempt_count() {
        let mut b = Backoff::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        });
        assert_eq!(b.next_delay(), None);
        b.begin();
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
        b.begin();
        assert_eq!(b.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(b.remaining(), 1);
        b.begin();
        assert_eq!(b.next_delay(), None);
    }
}
