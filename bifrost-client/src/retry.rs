use std::time::Duration;

use bifrost_protocol::ErrorKind;
use bifrost_protocol::NetworkConfig;
use rand::Rng;

/// Wraps a provider's `network` config with the attempt-loop decision of
/// spec §4.H: only `upstream`, `timeout`, and `rate_limited` classifications
/// are retried, and the wait is `min(initial · 2^attempt, max)` jittered by
/// up to 20% to avoid thundering-herd retries against the same upstream.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: NetworkConfig,
}

impl RetryPolicy {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        kind.is_retryable()
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_for_attempt(attempt);
        jitter(base)
    }
}

fn jitter(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor: f64 = rand::rng().random_range(0.8..=1.0);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkConfig {
        NetworkConfig {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff_initial: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(2),
        }
    }

    #[test]
    fn retries_only_the_documented_kinds() {
        let policy = RetryPolicy::new(config());
        assert!(policy.should_retry(ErrorKind::Upstream));
        assert!(policy.should_retry(ErrorKind::Timeout));
        assert!(policy.should_retry(ErrorKind::RateLimited));
        assert!(!policy.should_retry(ErrorKind::BadRequest));
        assert!(!policy.should_retry(ErrorKind::Unauthorized));
        assert!(!policy.should_retry(ErrorKind::Internal));
    }

    #[test]
    fn jittered_backoff_never_exceeds_the_doubled_cap() {
        let policy = RetryPolicy::new(config());
        for attempt in 0..6 {
            let delay = policy.backoff_for_attempt(attempt);
            assert!(delay <= Duration::from_secs(2));
        }
    }
}
