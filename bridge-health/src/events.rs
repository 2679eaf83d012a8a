//! Events published by the health monitor.

use bridge_primitives::{InstanceId, ToolId};

/// Health notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// An instance reached the consecutive failure limit.
    HealthCheckFailed {
        /// Failing instance.
        instance_id: InstanceId,
        /// Tool the instance runs.
        tool_id: ToolId,
        /// Failures since the last success.
        consecutive_failures: u32,
        /// Error text of the latest failure.
        error: String,
    },
    /// A healthy replacement tool was selected.
    FallbackTriggered {
        /// Failing instance.
        failed_instance_id: InstanceId,
        /// Tool the failing instance runs.
        failed_tool_id: ToolId,
        /// Replacement tool.
        fallback_tool_id: ToolId,
    },
    /// No healthy replacement exists.
    NoFallbackAvailable {
        /// Failing instance.
        instance_id: InstanceId,
        /// Tool the failing instance runs.
        tool_id: ToolId,
    },
}
