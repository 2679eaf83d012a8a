//! Error types for the integration manager.

use std::time::Duration;

use bridge_channel::ChannelError;
use bridge_primitives::{InstanceId, ToolId};
use bridge_resilience::Classify;
use thiserror::Error;

use crate::{ContextError, InstanceStatus, LifecycleError, TransformError};

/// Errors surfaced by [`IntegrationManager`](crate::IntegrationManager).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ManagerError {
    /// The tool did not finish loading in time.
    #[error("tool `{tool_id}` (instance {instance_id}) did not load within {timeout:?}")]
    ToolLoadingTimeout {
        /// Instance that was loading.
        instance_id: InstanceId,
        /// Tool being loaded.
        tool_id: ToolId,
        /// Bound that elapsed.
        timeout: Duration,
    },
    /// The instance exists but does not accept calls.
    #[error("instance {instance_id} is {status}, not ready")]
    InstanceNotReady {
        /// Target instance.
        instance_id: InstanceId,
        /// Its current status.
        status: InstanceStatus,
    },
    /// The tool does not declare the capability.
    #[error("instance {instance_id} has no capability `{capability}`")]
    CapabilityNotFound {
        /// Target instance.
        instance_id: InstanceId,
        /// Requested capability name.
        capability: String,
    },
    /// No such instance.
    #[error("instance {instance_id} not found")]
    InstanceNotFound {
        /// Requested instance.
        instance_id: InstanceId,
    },
    /// The catalog has no descriptor for the tool.
    #[error("tool `{tool_id}` is not in the catalog")]
    UnknownTool {
        /// Requested tool.
        tool_id: ToolId,
    },
    /// The instance's circuit is open.
    #[error("circuit for instance {instance_id} is open")]
    CircuitOpen {
        /// Target instance.
        instance_id: InstanceId,
    },
    /// Execution context failure.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// Data conversion failure.
    #[error(transparent)]
    Transform(#[from] TransformError),
    /// Channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Lifecycle violation.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl Classify for ManagerError {
    fn kind(&self) -> &str {
        match self {
            Self::ToolLoadingTimeout { .. } => "tool_loading_timeout",
            Self::InstanceNotReady { .. } => "instance_not_ready",
            Self::CapabilityNotFound { .. } => "capability_not_found",
            Self::InstanceNotFound { .. } => "instance_not_found",
            Self::UnknownTool { .. } => "unknown_tool",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Context(_) => "context",
            Self::Transform(_) => "transform",
            Self::Channel(err) => err.kind(),
            Self::Lifecycle(_) => "lifecycle",
        }
    }
}

/// Result alias for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;
