//! Retry delays for transient model-call failures.
//!
//! [`BackoffConfig`] decides how many times a failed call is re-sent and how
//! long to wait in between. The retry loop itself lives in
//! [`with_backoff`](super::with_backoff).

use std::time::Duration;

/// Exponential backoff with jitter.
///
/// # Example
///
/// ```
/// use llm_runnables::backend::BackoffConfig;
///
/// let none = BackoffConfig::none();
/// assert_eq!(none.max_retries, 0);
///
/// let interactive = BackoffConfig::interactive();
/// assert_eq!(interactive.max_retries, 2);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Cap on any single delay.
    pub max_delay: Duration,
    pub jitter: JitterStrategy,
    /// HTTP status codes worth retrying. Transport errors and timeouts always are.
    pub retryable_statuses: Vec<u16>,
    /// Wait for the provider's `Retry-After` hint instead of the computed delay.
    pub respect_retry_after: bool,
}

/// How randomness is mixed into the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Exactly the computed delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`.
    Equal,
}

impl BackoffConfig {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Batch-friendly: 3 retries starting at 1s, doubling up to 60s.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// Someone is waiting: 2 retries starting at 500ms, capped at 10s.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            ..Self::standard()
        }
    }

    /// Delay before retry number `attempt + 1` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let secs = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };
        Duration::from_secs_f64(secs)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> BackoffConfig {
        BackoffConfig {
            jitter: JitterStrategy::None,
            ..BackoffConfig::standard()
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let config = exact();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_capped() {
        let config = BackoffConfig {
            max_delay: Duration::from_secs(5),
            ..exact()
        };
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(12), Duration::from_secs(5));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let config = BackoffConfig::standard();
        for _ in 0..100 {
            assert!(config.delay_for_attempt(1) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_equal_jitter_lower_bound() {
        let config = BackoffConfig {
            jitter: JitterStrategy::Equal,
            ..BackoffConfig::standard()
        };
        for _ in 0..100 {
            let d = config.delay_for_attempt(0);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_secs(1));
        }
    }
}
