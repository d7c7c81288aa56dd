//! Retry policies with exponential backoff
//!
//! A [`RetryPolicy`] governs how a failed task attempt is retried: delays
//! grow exponentially from `initial_interval` by `backoff_factor`, capped
//! at `max_interval`, with optional jitter (a random 0.5x–1.5x factor) to
//! spread simultaneous retries. An optional predicate restricts which
//! errors are retryable; interrupts and cancellations are never retried
//! regardless of the predicate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::GraphError;

/// Predicate deciding whether a given error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&GraphError) -> bool + Send + Sync>;

/// Configuration for retrying failed task executions.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: usize,
    /// Delay before the first retry, in seconds
    pub initial_interval: f64,
    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f64,
    /// Upper bound on the delay, in seconds
    pub max_interval: f64,
    /// Randomize each delay by a 0.5x–1.5x factor
    pub jitter: bool,
    /// Which errors to retry; `None` retries execution and custom errors
    pub retry_on: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_interval", &self.max_interval)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and default backoff.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
            retry_on: None,
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, predicate: RetryPredicate) -> Self {
        self.retry_on = Some(predicate);
        self
    }

    /// Delay before the retry following `attempt` (1-based count of
    /// attempts already made).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_interval * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_interval);
        let final_delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay.max(0.0))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }

    /// Whether the error class is retryable under this policy.
    ///
    /// Interrupts, cancellations, validation failures, and persistence
    /// errors are never retried.
    pub fn is_retryable(&self, error: &GraphError) -> bool {
        if error.is_interrupt() || error.is_cancellation() {
            return false;
        }
        match &self.retry_on {
            Some(predicate) => predicate(error),
            None => matches!(error, GraphError::Execution(_) | GraphError::Custom(_)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::InterruptRecord;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, 0.5);
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.max_interval, 128.0);
        assert!(policy.jitter);
        assert!(policy.retry_on.is_none());
    }

    #[test]
    fn exponential_backoff_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(100.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(1).as_secs_f64(), 1.0);
        assert_eq!(policy.calculate_delay(2).as_secs_f64(), 2.0);
        assert_eq!(policy.calculate_delay(3).as_secs_f64(), 4.0);
    }

    #[test]
    fn delay_caps_at_max_interval() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(10.0)
            .with_max_interval(50.0)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(6).as_secs_f64(), 50.0);
    }

    #[test]
    fn should_retry_respects_budget() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn interrupts_and_cancellations_never_retry() {
        let policy = RetryPolicy::new(3).with_retry_on(Arc::new(|_| true));
        let interrupt = GraphError::Interrupted(vec![InterruptRecord::new(
            0,
            json!(0),
            vec!["n".into()],
        )]);
        let cancelled = GraphError::Cancelled {
            task: "n".into(),
        };
        assert!(!policy.is_retryable(&interrupt));
        assert!(!policy.is_retryable(&cancelled));
    }

    #[test]
    fn predicate_selects_errors() {
        let policy = RetryPolicy::new(3).with_retry_on(Arc::new(|e| {
            matches!(e, GraphError::Custom(msg) if msg.contains("transient"))
        }));
        assert!(policy.is_retryable(&GraphError::Custom("transient glitch".into())));
        assert!(!policy.is_retryable(&GraphError::Custom("permanent".into())));
        assert!(!policy.is_retryable(&GraphError::execution("anything")));
    }

    #[test]
    fn default_predicate_excludes_validation() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&GraphError::execution("boom")));
        assert!(!policy.is_retryable(&GraphError::validation("bad graph")));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_bounds(attempt in 1usize..8) {
            let policy = RetryPolicy::new(8)
                .with_initial_interval(1.0)
                .with_backoff_factor(2.0)
                .with_max_interval(60.0);
            let base = (1.0f64 * 2.0f64.powi(attempt as i32 - 1)).min(60.0);
            let delay = policy.calculate_delay(attempt).as_secs_f64();
            prop_assert!(delay >= base * 0.5 - 1e-9);
            prop_assert!(delay <= base * 1.5 + 1e-9);
        }
    }
}
