//! Wire envelope exchanged with tool instances.

use std::fmt;

use bridge_primitives::{InstanceId, MessageId};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};

const RESPONSE_SUFFIX: &str = "_response";

/// Message verb carried in the envelope's `type` field.
///
/// Unrecognised verbs are preserved in [`Verb::Other`] so newer tools can talk
/// to older hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Host → tool: configuration and capability list after setup.
    Initialize,
    /// Host → tool: run a capability.
    ExecuteCapability,
    /// Tool → host: capability result.
    ExecuteCapabilityResponse,
    /// Host → tool: push data into the tool.
    DataTransfer,
    /// Tool → host: data transfer acknowledgement.
    DataTransferResponse,
    /// Host → tool: liveness probe.
    Ping,
    /// Tool → host: liveness probe answer.
    Pong,
    /// Tool → host: the tool probing the host.
    HealthCheck,
    /// Host → tool: answer to a tool-initiated health check.
    HealthCheckResponse,
    /// Host → tool: the instance is about to be destroyed.
    Cleanup,
    /// Tool → host: cleanup acknowledgement.
    CleanupResponse,
    /// Tool → host: the tool finished booting.
    ToolReady,
    /// Tool → host: the tool hit an internal error.
    ToolError,
    /// Tool → host: the tool's document changed.
    DataChanged,
    /// Tool → host: long-running work progressed.
    ProgressUpdate,
    /// Tool → host: an asynchronous capability finished.
    CapabilityCompleted,
    /// Any verb outside the reserved set.
    Other(String),
}

impl Verb {
    /// Returns the wire spelling.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialize => "initialize",
            Self::ExecuteCapability => "execute_capability",
            Self::ExecuteCapabilityResponse => "execute_capability_response",
            Self::DataTransfer => "data_transfer",
            Self::DataTransferResponse => "data_transfer_response",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::HealthCheck => "health_check",
            Self::HealthCheckResponse => "health_check_response",
            Self::Cleanup => "cleanup",
            Self::CleanupResponse => "cleanup_response",
            Self::ToolReady => "tool_ready",
            Self::ToolError => "tool_error",
            Self::DataChanged => "data_changed",
            Self::ProgressUpdate => "progress_update",
            Self::CapabilityCompleted => "capability_completed",
            Self::Other(verb) => verb,
        }
    }

    /// Returns `true` for verbs that answer a pending request.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Pong) || self.as_str().ends_with(RESPONSE_SUFFIX)
    }

    /// Verb a peer uses to answer this one.
    #[must_use]
    pub fn response(&self) -> Self {
        match self {
            Self::Ping => Self::Pong,
            other => Self::from(format!("{}{RESPONSE_SUFFIX}", other.as_str()).as_str()),
        }
    }
}

impl From<&str> for Verb {
    fn from(value: &str) -> Self {
        match value {
            "initialize" => Self::Initialize,
            "execute_capability" => Self::ExecuteCapability,
            "execute_capability_response" => Self::ExecuteCapabilityResponse,
            "data_transfer" => Self::DataTransfer,
            "data_transfer_response" => Self::DataTransferResponse,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "health_check" => Self::HealthCheck,
            "health_check_response" => Self::HealthCheckResponse,
            "cleanup" => Self::Cleanup,
            "cleanup_response" => Self::CleanupResponse,
            "tool_ready" => Self::ToolReady,
            "tool_error" => Self::ToolError,
            "data_changed" => Self::DataChanged,
            "progress_update" => Self::ProgressUpdate,
            "capability_completed" => Self::CapabilityCompleted,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Verb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Verb {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VerbVisitor;

        impl Visitor<'_> for VerbVisitor {
            type Value = Verb;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a message type string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Verb, E> {
                if value.is_empty() {
                    return Err(E::custom("message type cannot be empty"));
                }
                Ok(Verb::from(value))
            }
        }

        deserializer.deserialize_str(VerbVisitor)
    }
}

/// Protocol envelope: `{type, messageId, instanceId, payload?, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    verb: Verb,
    message_id: MessageId,
    instance_id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    timestamp: i64,
}

impl Envelope {
    /// Creates an envelope with a fresh message id stamped with the current time.
    #[must_use]
    pub fn new(verb: Verb, instance_id: InstanceId, payload: Option<Value>) -> Self {
        Self {
            verb,
            message_id: MessageId::random(),
            instance_id,
            payload,
            timestamp: now_millis(),
        }
    }

    /// Builds the response to this envelope, reusing its message id.
    #[must_use]
    pub fn reply(&self, payload: Option<Value>) -> Self {
        Self {
            verb: self.verb.response(),
            message_id: self.message_id,
            instance_id: self.instance_id,
            payload,
            timestamp: now_millis(),
        }
    }

    /// Builds an error response carrying `payload.error`.
    #[must_use]
    pub fn error_reply(&self, reason: impl Into<String>) -> Self {
        self.reply(Some(json!({ "error": reason.into() })))
    }

    /// Message verb.
    #[must_use]
    pub fn verb(&self) -> &Verb {
        &self.verb
    }

    /// Correlation id.
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Instance the envelope belongs to.
    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Optional payload.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Send time in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Error text carried in `payload.error`, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self.payload.as_ref()?.get("error")? {
            Value::Null => None,
            Value::String(reason) => Some(reason.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Consumes the envelope, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Option<Value> {
        self.payload
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_matches_protocol() {
        let envelope = Envelope::new(
            Verb::ExecuteCapability,
            InstanceId::random(),
            Some(json!({"capability": "resize"})),
        );
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "execute_capability");
        assert!(value["messageId"].is_string());
        assert!(value["instanceId"].is_string());
        assert!(value["timestamp"].is_i64());
        assert_eq!(value["payload"]["capability"], "resize");
    }

    #[test]
    fn payload_is_optional_on_the_wire() {
        let raw = format!(
            r#"{{"type":"tool_ready","messageId":"{}","instanceId":"{}","timestamp":1}}"#,
            MessageId::random(),
            InstanceId::random()
        );
        let envelope: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope.verb(), &Verb::ToolReady);
        assert!(envelope.payload().is_none());
    }

    #[test]
    fn response_detection() {
        assert!(Verb::Pong.is_response());
        assert!(Verb::ExecuteCapabilityResponse.is_response());
        assert!(Verb::from("custom_response").is_response());
        assert!(!Verb::Ping.is_response());
        assert!(!Verb::ToolReady.is_response());
    }

    #[test]
    fn replies_reuse_message_id() {
        let request = Envelope::new(Verb::Ping, InstanceId::random(), None);
        let reply = request.reply(None);
        assert_eq!(reply.verb(), &Verb::Pong);
        assert_eq!(reply.message_id(), request.message_id());

        let failure = Envelope::new(Verb::DataTransfer, InstanceId::random(), None)
            .error_reply("disk full");
        assert_eq!(failure.verb(), &Verb::DataTransferResponse);
        assert_eq!(failure.error().as_deref(), Some("disk full"));
    }

    #[test]
    fn unknown_verbs_round_trip() {
        let verb: Verb = serde_json::from_str("\"selection_changed\"").unwrap();
        assert_eq!(verb, Verb::Other("selection_changed".into()));
        assert_eq!(serde_json::to_string(&verb).unwrap(), "\"selection_changed\"");
    }
}
