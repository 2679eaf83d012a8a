//! Health monitor configuration.

use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use crate::{HealthError, HealthResult, HealthStatus};

/// Thresholds and cadence for health monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    check_interval: Duration,
    degraded_threshold: Duration,
    unhealthy_threshold: Duration,
    max_consecutive_failures: NonZeroU32,
    event_capacity: NonZeroUsize,
}

impl HealthConfig {
    /// Returns the period of the background check loop.
    #[must_use]
    pub const fn check_interval(self) -> Duration {
        self.check_interval
    }

    /// Latency above which an instance is degraded.
    #[must_use]
    pub const fn degraded_threshold(self) -> Duration {
        self.degraded_threshold
    }

    /// Latency above which an instance is unhealthy.
    #[must_use]
    pub const fn unhealthy_threshold(self) -> Duration {
        self.unhealthy_threshold
    }

    /// Consecutive failed checks that trigger fallback resolution.
    #[must_use]
    pub const fn max_consecutive_failures(self) -> NonZeroU32 {
        self.max_consecutive_failures
    }

    /// Capacity of the event broadcast buffer.
    #[must_use]
    pub const fn event_capacity(self) -> NonZeroUsize {
        self.event_capacity
    }

    /// Sets the check loop period.
    #[must_use]
    pub const fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets both latency thresholds.
    #[must_use]
    pub const fn with_thresholds(mut self, degraded: Duration, unhealthy: Duration) -> Self {
        self.degraded_threshold = degraded;
        self.unhealthy_threshold = unhealthy;
        self
    }

    /// Sets the consecutive failure limit.
    #[must_use]
    pub const fn with_max_consecutive_failures(mut self, failures: NonZeroU32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    /// Sets the event buffer capacity.
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Classifies a successful round trip.
    ///
    /// Thresholds are exclusive: a latency equal to a threshold does not
    /// exceed it.
    #[must_use]
    pub fn classify(self, latency: Duration) -> HealthStatus {
        if latency > self.unhealthy_threshold {
            HealthStatus::Unhealthy
        } else if latency > self.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError::InvalidConfig`] when the interval is zero or the
    /// degraded threshold exceeds the unhealthy one.
    pub fn validate(self) -> HealthResult<()> {
        if self.check_interval.is_zero() {
            return Err(HealthError::InvalidConfig(
                "check interval must be greater than zero",
            ));
        }
        if self.degraded_threshold > self.unhealthy_threshold {
            return Err(HealthError::InvalidConfig(
                "degraded threshold cannot exceed unhealthy threshold",
            ));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            degraded_threshold: Duration::from_millis(1000),
            unhealthy_threshold: Duration::from_millis(5000),
            max_consecutive_failures: NonZeroU32::new(3).expect("non-zero"),
            event_capacity: NonZeroUsize::new(256).expect("non-zero"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_exclusive() {
        let config = HealthConfig::default();
        assert_eq!(config.classify(Duration::from_millis(3)), HealthStatus::Healthy);
        assert_eq!(config.classify(Duration::from_millis(1000)), HealthStatus::Healthy);
        assert_eq!(config.classify(Duration::from_millis(1001)), HealthStatus::Degraded);
        assert_eq!(config.classify(Duration::from_millis(5000)), HealthStatus::Degraded);
        assert_eq!(config.classify(Duration::from_millis(5001)), HealthStatus::Unhealthy);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = HealthConfig::default()
            .with_thresholds(Duration::from_secs(5), Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(HealthError::InvalidConfig(_))));
        assert!(HealthConfig::default().validate().is_ok());
    }
}
