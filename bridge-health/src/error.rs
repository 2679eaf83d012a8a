//! Errors raised by the health monitor.

use bridge_primitives::InstanceId;
use thiserror::Error;

/// Errors surfaced by [`HealthMonitor`](crate::HealthMonitor).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    /// The instance is not registered with the monitor.
    #[error("instance {instance_id} is not monitored")]
    UnknownInstance {
        /// Requested instance.
        instance_id: InstanceId,
    },
    /// Monitor configuration was invalid.
    #[error("invalid health configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result alias for health operations.
pub type HealthResult<T> = Result<T, HealthError>;
