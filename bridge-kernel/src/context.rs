//! Isolated execution contexts the manager loads tools into.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_channel::ContextHandle;
use bridge_primitives::{InstanceId, ToolDescriptor};
use thiserror::Error;

/// Failures creating or placing an execution context.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// The factory could not create the context.
    #[error("failed to create execution context: {reason}")]
    Create {
        /// Human-readable context provided by the factory.
        reason: String,
    },
    /// The container refused the context.
    #[error("container rejected instance {instance_id}: {reason}")]
    Attach {
        /// Instance being attached.
        instance_id: InstanceId,
        /// Human-readable context provided by the container.
        reason: String,
    },
}

impl ContextError {
    /// Convenience helper to construct creation errors.
    #[must_use]
    pub fn create(reason: impl Into<String>) -> Self {
        Self::Create {
            reason: reason.into(),
        }
    }
}

/// A live, isolated execution context hosting one tool instance.
#[async_trait]
pub trait ToolContext: Send + Sync {
    /// Handle used to post messages into the context.
    fn handle(&self) -> Arc<dyn ContextHandle>;

    /// Resolves once the tool's document has finished loading.
    async fn loaded(&self);
}

/// Creates isolated execution contexts.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    /// Creates a context for `instance_id` under the descriptor's sandbox
    /// policy, pointed at the descriptor's source.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Create`] when the context cannot be created.
    async fn create(
        &self,
        instance_id: InstanceId,
        descriptor: &ToolDescriptor,
    ) -> Result<Arc<dyn ToolContext>, ContextError>;

    /// Called once the manager has let go of the instance's context, whether
    /// it was unloaded or abandoned mid-load.
    fn release(&self, _instance_id: InstanceId) {}
}

/// Host-side slot a context is placed into.
pub trait Container: Send + Sync {
    /// Places the context into the container.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Attach`] when the container refuses it.
    fn attach(&self, instance_id: InstanceId, context: &Arc<dyn ToolContext>)
    -> Result<(), ContextError>;

    /// Removes the context for `instance_id`, if present.
    fn detach(&self, instance_id: InstanceId);
}
