//! Core shared types for embedding sandboxed capability providers.

#![warn(missing_docs, clippy::pedantic)]

mod capability;
mod descriptor;
mod error;
mod ids;

/// Capability descriptors and supporting builders.
pub use capability::{Capability, CapabilityBuilder};
/// Immutable description of an embeddable tool.
pub use descriptor::{SandboxPolicy, ToolConfig, ToolDescriptor, ToolDescriptorBuilder};
/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Identifiers for tools, running instances, and protocol messages.
pub use ids::{InstanceId, MessageId, ToolId};
