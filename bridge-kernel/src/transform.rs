//! Data conversion between tools.

use async_trait::async_trait;
use bridge_primitives::ToolDescriptor;
use serde_json::Value;
use thiserror::Error;

/// Conversion failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot convert data from `{source_tool}` to `{target_tool}`: {reason}")]
pub struct TransformError {
    /// Tool the data comes from.
    pub source_tool: String,
    /// Tool the data goes to.
    pub target_tool: String,
    /// Human-readable context provided by the transformer.
    pub reason: String,
}

impl TransformError {
    /// Creates an error for the given tool pair.
    #[must_use]
    pub fn new(source: &ToolDescriptor, target: &ToolDescriptor, reason: impl Into<String>) -> Self {
        Self {
            source_tool: source.id().to_string(),
            target_tool: target.id().to_string(),
            reason: reason.into(),
        }
    }
}

/// Converts data produced by one tool into a form another accepts.
#[async_trait]
pub trait DataTransformer: Send + Sync {
    /// Converts `data` from `source`'s output format to `target`'s input
    /// format.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] when no conversion exists.
    async fn transform(
        &self,
        data: Value,
        source: &ToolDescriptor,
        target: &ToolDescriptor,
    ) -> Result<Value, TransformError>;
}

/// Transformer that hands data through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTransformer;

#[async_trait]
impl DataTransformer for PassthroughTransformer {
    async fn transform(
        &self,
        data: Value,
        _source: &ToolDescriptor,
        _target: &ToolDescriptor,
    ) -> Result<Value, TransformError> {
        Ok(data)
    }
}
