//! Strongly typed configuration schema.

use std::collections::BTreeMap;
use std::time::Duration;

use bridge_primitives::ToolId;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct BridgeConfig {
    /// Communication channel settings.
    pub channel: ChannelSettings,
    /// Health monitor settings.
    pub health: HealthSettings,
    /// Integration manager settings.
    pub manager: ManagerSettings,
    /// Per-instance circuit breaker.
    pub circuit: CircuitSettings,
    /// Retry policy applied to manager calls.
    pub retry: RetrySettings,
    /// Logging settings.
    pub telemetry: TelemetrySettings,
    /// Fallback options keyed by the tool they replace.
    pub fallbacks: BTreeMap<ToolId, Vec<FallbackSettings>>,
}

impl BridgeConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents and
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, plus the
    /// errors of [`BridgeConfig::from_json_str`].
    pub fn from_path(path: impl AsRef<std::path::Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> ConfigResult<()> {
        self.channel.validate()?;
        self.health.validate()?;
        self.manager.validate()?;
        self.circuit.validate()?;
        self.retry.validate()?;

        for (tool_id, options) in &self.fallbacks {
            if options.iter().any(|option| &option.tool_id == tool_id) {
                return Err(ConfigError::invalid(format!(
                    "tool `{tool_id}` lists itself as a fallback"
                )));
            }
        }
        Ok(())
    }
}

/// Channel timeouts and inbound filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ChannelSettings {
    /// Bound on a new context becoming reachable.
    pub ready_timeout_ms: u64,
    /// Per-attempt timeout for capability calls and data transfers.
    pub request_timeout_ms: u64,
    /// Re-sends after the first attempt.
    pub max_retries: u32,
    /// Per-attempt timeout for pings.
    pub ping_timeout_ms: u64,
    /// Re-sends for pings.
    pub ping_max_retries: u32,
    /// Base re-send delay; doubles per retry.
    pub retry_delay_ms: u64,
    /// Bound on the cleanup request sent on destroy.
    pub cleanup_timeout_ms: u64,
    /// Accepted message origins; empty accepts all.
    pub allowed_origins: Vec<String>,
    /// Event buffer capacity.
    pub event_capacity: usize,
}

impl ChannelSettings {
    /// Readiness bound.
    #[must_use]
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Ping timeout.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Base re-send delay.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Cleanup bound.
    #[must_use]
    pub const fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("channel.readyTimeoutMs", self.ready_timeout_ms)?;
        require_positive("channel.requestTimeoutMs", self.request_timeout_ms)?;
        require_positive("channel.pingTimeoutMs", self.ping_timeout_ms)?;
        require_positive("channel.cleanupTimeoutMs", self.cleanup_timeout_ms)?;
        require_positive("channel.eventCapacity", self.event_capacity as u64)
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 30_000,
            request_timeout_ms: 10_000,
            max_retries: 3,
            ping_timeout_ms: 5_000,
            ping_max_retries: 0,
            retry_delay_ms: 1_000,
            cleanup_timeout_ms: 5_000,
            allowed_origins: Vec::new(),
            event_capacity: 256,
        }
    }
}

/// Health classification and probing cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthSettings {
    /// Period of the background check loop.
    pub check_interval_ms: u64,
    /// Latency above which an instance is degraded.
    pub degraded_threshold_ms: u64,
    /// Latency above which an instance is unhealthy.
    pub unhealthy_threshold_ms: u64,
    /// Consecutive failed checks that trigger fallback resolution.
    pub max_consecutive_failures: u32,
    /// Whether the runtime starts the check loop on assembly.
    pub start_monitoring: bool,
    /// Event buffer capacity.
    pub event_capacity: usize,
}

impl HealthSettings {
    /// Check loop period.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Degraded threshold.
    #[must_use]
    pub const fn degraded_threshold(&self) -> Duration {
        Duration::from_millis(self.degraded_threshold_ms)
    }

    /// Unhealthy threshold.
    #[must_use]
    pub const fn unhealthy_threshold(&self) -> Duration {
        Duration::from_millis(self.unhealthy_threshold_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("health.checkIntervalMs", self.check_interval_ms)?;
        require_positive(
            "health.maxConsecutiveFailures",
            u64::from(self.max_consecutive_failures),
        )?;
        require_positive("health.eventCapacity", self.event_capacity as u64)?;
        if self.degraded_threshold_ms > self.unhealthy_threshold_ms {
            return Err(ConfigError::invalid(
                "health.degradedThresholdMs cannot exceed health.unhealthyThresholdMs",
            ));
        }
        Ok(())
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            degraded_threshold_ms: 1_000,
            unhealthy_threshold_ms: 5_000,
            max_consecutive_failures: 3,
            start_monitoring: true,
            event_capacity: 256,
        }
    }
}

/// Instance manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ManagerSettings {
    /// Default bound on a tool finishing its load.
    pub load_timeout_ms: u64,
    /// Whether the runtime reacts to health failures.
    pub start_recovery: bool,
    /// Event buffer capacity.
    pub event_capacity: usize,
}

impl ManagerSettings {
    /// Load bound.
    #[must_use]
    pub const fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("manager.loadTimeoutMs", self.load_timeout_ms)?;
        require_positive("manager.eventCapacity", self.event_capacity as u64)
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            load_timeout_ms: 30_000,
            start_recovery: true,
            event_capacity: 256,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitSettings {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe.
    pub reset_timeout_ms: u64,
}

impl CircuitSettings {
    /// Reset timeout.
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("circuit.failureThreshold", u64::from(self.failure_threshold))
    }
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// Retry policy applied around manager calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrySettings {
    /// Whether manager calls are retried at all.
    pub enabled: bool,
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on the delay.
    pub max_delay_ms: Option<u64>,
    /// Error kinds that may be retried; absent retries every kind.
    pub retryable_kinds: Option<Vec<String>>,
}

impl RetrySettings {
    /// Base delay.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("retry.maxAttempts", u64::from(self.max_attempts))?;
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoffMultiplier must be a finite value >= 1.0",
            ));
        }
        if self.max_delay_ms.is_some_and(|max| max < self.base_delay_ms) {
            return Err(ConfigError::invalid(
                "retry.maxDelayMs cannot be smaller than retry.baseDelayMs",
            ));
        }
        Ok(())
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
            retryable_kinds: Some(vec!["message_timeout".to_owned()]),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TelemetrySettings {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Whether channel, health, and manager events are logged.
    pub log_events: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            log_events: true,
        }
    }
}

/// One fallback option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FallbackSettings {
    /// Replacement tool.
    pub tool_id: ToolId,
    /// Rank among the options; lower is preferred.
    pub priority: u32,
    /// Capabilities both tools provide.
    #[serde(default)]
    pub capability_overlap: Vec<String>,
}

fn require_positive(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::invalid(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = BridgeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.channel.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.health.check_interval(), Duration::from_secs(60));
        assert_eq!(config.manager.load_timeout(), Duration::from_secs(30));
        assert_eq!(config.circuit.failure_threshold, 5);
        assert!(!config.retry.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = BridgeConfig::from_json_str(
            r#"{
                "channel": {"requestTimeoutMs": 2500, "allowedOrigins": ["https://tools.example"]},
                "health": {"degradedThresholdMs": 200, "unhealthyThresholdMs": 800},
                "fallbacks": {
                    "image-editor": [{"toolId": "paint-lite", "priority": 1}]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.channel.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.channel.max_retries, 3);
        assert_eq!(config.health.unhealthy_threshold(), Duration::from_millis(800));
        let options = &config.fallbacks[&ToolId::new("image-editor").unwrap()];
        assert_eq!(options[0].tool_id.as_str(), "paint-lite");
        assert!(options[0].capability_overlap.is_empty());
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = BridgeConfig::from_json_str(r#"{"channel": {"requestTimeout": 5}}"#)
            .expect_err("misspelled field");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_inconsistent_values() {
        let inverted =
            r#"{"health": {"degradedThresholdMs": 9000, "unhealthyThresholdMs": 100}}"#;
        assert!(matches!(
            BridgeConfig::from_json_str(inverted),
            Err(ConfigError::Invalid(_))
        ));

        let zero = r#"{"circuit": {"failureThreshold": 0}}"#;
        assert!(matches!(
            BridgeConfig::from_json_str(zero),
            Err(ConfigError::Invalid(_))
        ));

        let self_fallback = r#"{"fallbacks": {"a": [{"toolId": "a", "priority": 1}]}}"#;
        assert!(matches!(
            BridgeConfig::from_json_str(self_fallback),
            Err(ConfigError::Invalid(_))
        ));
    }
}
