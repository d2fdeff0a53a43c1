//! Exponential backoff with jitter for transient network failures.

use std::time::Duration;

use rand::Rng;

/// Backoff policy: retry up to `max_attempts` times, doubling the
/// delay each time up to `max_delay`, with up to 50% jitter added so
/// that concurrent dataset runs do not retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// The delay to sleep before retry attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_secs_f64(capped.as_secs_f64() * jitter_frac)
    }
}

/// Whether an HTTP status code should be retried (5xx) or treated as
/// terminal (everything else, in particular 404/401/403).
pub fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_stays_capped() {
        let policy = RetryPolicy::default();
        let d0 = policy.delay_for(0);
        let d4 = policy.delay_for(4);
        assert!(d0 <= policy.base_delay);
        assert!(d4 <= policy.max_delay);
    }

    #[test]
    fn only_server_errors_are_retryable() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(200));
    }
}
