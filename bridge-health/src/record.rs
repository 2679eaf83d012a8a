//! Per-instance health records.

use std::time::Duration;

use bridge_primitives::ToolId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health classification of an instance or tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Answering within the degraded threshold.
    Healthy,
    /// Answering, but slowly.
    Degraded,
    /// Failing or answering too slowly to be useful.
    Unhealthy,
}

/// Latest health observations for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Tool the instance runs.
    pub tool_id: ToolId,
    /// Current classification.
    pub status: HealthStatus,
    /// Round trip of the last successful check.
    pub last_latency: Option<Duration>,
    /// Failed checks over the instance's lifetime.
    pub error_count: u64,
    /// Failed checks since the last success.
    pub consecutive_failures: u32,
    /// When the last check completed.
    pub last_checked: Option<DateTime<Utc>>,
    /// Error text of the last failed check.
    pub last_error: Option<String>,
}

impl HealthRecord {
    pub(crate) fn new(tool_id: ToolId) -> Self {
        Self {
            tool_id,
            status: HealthStatus::Healthy,
            last_latency: None,
            error_count: 0,
            consecutive_failures: 0,
            last_checked: None,
            last_error: None,
        }
    }

    pub(crate) fn record_success(&mut self, status: HealthStatus, latency: Duration) {
        self.status = status;
        self.last_latency = Some(latency);
        self.consecutive_failures = 0;
        self.last_checked = Some(Utc::now());
    }

    pub(crate) fn record_failure(&mut self, error: String) {
        self.status = HealthStatus::Unhealthy;
        self.error_count = self.error_count.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error);
        self.last_checked = Some(Utc::now());
    }
}
