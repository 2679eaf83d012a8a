//! Unsolicited events raised by tool instances.

use bridge_primitives::InstanceId;
use serde_json::Value;

use crate::Envelope;

/// Typed view of the reserved tool → host event verbs.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// `tool_ready`
    ToolReady {
        /// Sending instance.
        instance_id: InstanceId,
        /// Optional payload.
        payload: Option<Value>,
    },
    /// `tool_error`
    ToolError {
        /// Sending instance.
        instance_id: InstanceId,
        /// Error text reported by the tool.
        error: String,
    },
    /// `data_changed`
    DataChanged {
        /// Sending instance.
        instance_id: InstanceId,
        /// Optional payload.
        payload: Option<Value>,
    },
    /// `capability_completed`
    CapabilityCompleted {
        /// Sending instance.
        instance_id: InstanceId,
        /// Optional payload.
        payload: Option<Value>,
    },
    /// `progress_update`
    ProgressUpdate {
        /// Sending instance.
        instance_id: InstanceId,
        /// Optional payload.
        payload: Option<Value>,
    },
}

impl ChannelEvent {
    /// Instance that raised the event.
    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        match self {
            Self::ToolReady { instance_id, .. }
            | Self::ToolError { instance_id, .. }
            | Self::DataChanged { instance_id, .. }
            | Self::CapabilityCompleted { instance_id, .. }
            | Self::ProgressUpdate { instance_id, .. } => *instance_id,
        }
    }
}

/// Callback registered for a verb via
/// [`CommunicationChannel::register_handler`](crate::CommunicationChannel::register_handler).
pub trait MessageHandler: Send + Sync {
    /// Called for every inbound event envelope with the registered verb.
    fn handle(&self, envelope: &Envelope);
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope) + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) {
        (self)(envelope);
    }
}
