//! Error types for the communication channel.

use std::time::Duration;

use bridge_primitives::{InstanceId, MessageId};
use bridge_resilience::Classify;
use thiserror::Error;

use crate::TransportError;

/// Errors surfaced by channel operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    /// The child context never became reachable.
    #[error("instance {instance_id} did not become reachable within {timeout:?}")]
    InstanceReadyTimeout {
        /// Instance being set up.
        instance_id: InstanceId,
        /// Bound that elapsed.
        timeout: Duration,
    },
    /// No response arrived after every re-send.
    #[error("request {message_id} ({verb}) to instance {instance_id} timed out after {attempts} attempt(s)")]
    MessageTimeout {
        /// Target instance.
        instance_id: InstanceId,
        /// Correlation id of the abandoned request.
        message_id: MessageId,
        /// Request verb.
        verb: String,
        /// Number of times the envelope was posted.
        attempts: u32,
    },
    /// The instance was torn down while the request was pending.
    #[error("instance {instance_id} was destroyed")]
    InstanceDestroyed {
        /// Destroyed instance.
        instance_id: InstanceId,
    },
    /// A session already exists for the instance.
    #[error("instance {instance_id} already has a channel session")]
    InstanceExists {
        /// Instance being set up.
        instance_id: InstanceId,
    },
    /// No session exists for the instance.
    #[error("instance {instance_id} has no channel session")]
    UnknownInstance {
        /// Requested instance.
        instance_id: InstanceId,
    },
    /// The transport refused the envelope.
    #[error("transport failure for instance {instance_id}: {source}")]
    Transport {
        /// Target instance.
        instance_id: InstanceId,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// The tool answered with `payload.error`.
    #[error("instance {instance_id} reported an error: {reason}")]
    Remote {
        /// Responding instance.
        instance_id: InstanceId,
        /// Error text supplied by the tool.
        reason: String,
    },
}

impl Classify for ChannelError {
    fn kind(&self) -> &str {
        match self {
            Self::InstanceReadyTimeout { .. } => "instance_ready_timeout",
            Self::MessageTimeout { .. } => "message_timeout",
            Self::InstanceDestroyed { .. } => "instance_destroyed",
            Self::InstanceExists { .. } => "instance_exists",
            Self::UnknownInstance { .. } => "unknown_instance",
            Self::Transport { .. } => "transport",
            Self::Remote { .. } => "remote",
        }
    }
}

/// Result alias for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
