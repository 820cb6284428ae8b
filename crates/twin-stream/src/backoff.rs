use std::time::Duration;

/// `delay = min(cap, base * 2^attempt) + jitter(0..=jitter_max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
            jitter_max: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let exponential = self.base.saturating_mul(factor).min(self.cap);
        exponential + jitter.min(self.jitter_max)
    }
}

/// Per-client retry state. Not shared between subscriptions.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let max_ms = u64::try_from(self.policy.jitter_max.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = fastrand::u64(0..=max_ms);
        let delay = self
            .policy
            .delay_for(self.attempt, Duration::from_millis(jitter_ms));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(1_000),
            jitter_max: Duration::ZERO,
        };
        let delays: Vec<_> = (0..6)
            .map(|attempt| policy.delay_for(attempt, Duration::ZERO).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(
            policy.delay_for(u32::MAX, Duration::ZERO),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn jitter_is_clamped_to_policy_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.delay_for(0, Duration::from_secs(5)),
            Duration::from_millis(750)
        );
    }

    #[test]
    fn third_retry_exceeds_first_and_reset_restarts() {
        let policy = BackoffPolicy::default();
        let mut backoff = Backoff::new(policy);
        let first = backoff.next_delay();
        let _second = backoff.next_delay();
        let third = backoff.next_delay();
        assert!(third > first);
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        let after_reset = backoff.next_delay();
        assert!(after_reset >= policy.base);
        assert!(after_reset <= policy.base + policy.jitter_max);
    }
}
