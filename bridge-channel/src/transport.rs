//! Transport boundary into an isolated execution context.

use async_trait::async_trait;
use thiserror::Error;

use crate::Envelope;

/// Irrecoverable delivery failures at the transport boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The execution context is gone.
    #[error("execution context is closed")]
    Closed,
    /// The facility refused the message.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Handle used to post messages into one sandboxed child context.
///
/// Posting is fire-and-forget: success means the message was handed to the
/// facility, not that the tool received it.
#[async_trait]
pub trait ContextHandle: Send + Sync {
    /// Posts an envelope into the context.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the context can no longer accept
    /// messages.
    fn post(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Resolves once the context can receive messages.
    async fn reachable(&self);
}
