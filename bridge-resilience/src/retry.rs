//! Retry policy and outcome types.

use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::time::Duration;

use thiserror::Error;

/// Errors that expose a stable, machine-readable kind.
///
/// Retry policies filter on these kinds.
pub trait Classify {
    /// Returns the error kind, e.g. `message_timeout`.
    fn kind(&self) -> &str;
}

/// Errors raised while validating retry configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    /// Policy failed validation.
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(&'static str),
}

/// Result alias for retry configuration.
pub type RetryResult<T> = Result<T, RetryError>;

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: NonZeroU32,
    base_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Option<Duration>,
    retryable_kinds: Option<BTreeSet<String>>,
}

impl RetryPolicy {
    /// Creates a policy with the supplied attempt bound and base delay.
    #[must_use]
    pub fn new(max_attempts: NonZeroU32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_multiplier: 2.0,
            max_delay: None,
            retryable_kinds: None,
        }
    }

    /// Sets the multiplier applied to the delay after each attempt.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Caps the delay between attempts.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Restricts retries to errors whose [`Classify::kind`] is listed.
    #[must_use]
    pub fn with_retryable_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the attempt bound.
    #[must_use]
    pub const fn max_attempts(&self) -> NonZeroU32 {
        self.max_attempts
    }

    /// Returns the delay before the first retry.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the backoff multiplier.
    #[must_use]
    pub const fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Returns `true` when errors of `kind` may be retried.
    #[must_use]
    pub fn is_retryable(&self, kind: &str) -> bool {
        self.retryable_kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(kind))
    }

    /// Delay to wait after the given (1-based) failed attempt:
    /// `base_delay * backoff_multiplier^(attempt - 1)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::InvalidPolicy`] when the multiplier is below 1.0 or
    /// not finite, or when the delay cap is smaller than the base delay.
    pub fn validate(&self) -> RetryResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(RetryError::InvalidPolicy(
                "backoff multiplier must be a finite value >= 1.0",
            ));
        }
        if self.max_delay.is_some_and(|max| max < self.base_delay) {
            return Err(RetryError::InvalidPolicy(
                "max delay cannot be smaller than base delay",
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(NonZeroU32::new(3).expect("non-zero"), Duration::from_secs(1))
    }
}

/// Result record of [`RetryExecutor::execute_with_retry`](crate::RetryExecutor::execute_with_retry).
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    result: Result<T, E>,
    attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    pub(crate) fn new(result: Result<T, E>, attempts: u32) -> Self {
        Self { result, attempts }
    }

    /// Returns `true` when one of the attempts succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Number of times the operation was invoked.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Value produced by the successful attempt.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    /// Error produced by the final attempt when every attempt failed.
    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        self.result.as_ref().err()
    }

    /// Converts the outcome into a plain `Result`.
    ///
    /// # Errors
    ///
    /// Returns the last error when every attempt failed.
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(NonZeroU32::new(4).unwrap(), Duration::from_millis(100))
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = policy().with_backoff_multiplier(3.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(3), Duration::from_millis(900));
    }

    #[test]
    fn delays_respect_cap() {
        let policy = policy().with_max_delay(Duration::from_millis(250));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn all_kinds_retryable_by_default() {
        assert!(policy().is_retryable("anything"));
        let filtered = policy().with_retryable_kinds(["message_timeout"]);
        assert!(filtered.is_retryable("message_timeout"));
        assert!(!filtered.is_retryable("capability_not_found"));
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let err = policy()
            .with_backoff_multiplier(0.5)
            .validate()
            .expect_err("multiplier below one");
        assert!(matches!(err, RetryError::InvalidPolicy(_)));
    }
}
