//! Static fallback graph between tools.

use std::collections::HashMap;

use bridge_primitives::ToolId;
use serde::{Deserialize, Serialize};

use crate::HealthStatus;

/// A tool that can stand in for another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackOption {
    /// Replacement tool.
    pub tool_id: ToolId,
    /// Rank among the options; lower is preferred.
    pub priority: u32,
    /// Capabilities both tools provide.
    #[serde(default)]
    pub capability_overlap: Vec<String>,
}

impl FallbackOption {
    /// Creates an option without capability overlap information.
    #[must_use]
    pub fn new(tool_id: ToolId, priority: u32) -> Self {
        Self {
            tool_id,
            priority,
            capability_overlap: Vec::new(),
        }
    }

    /// Records the capabilities shared with the failed tool.
    #[must_use]
    pub fn with_overlap<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capability_overlap = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Fallback option paired with the health derived for it at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackCandidate {
    /// Configured option.
    pub option: FallbackOption,
    /// Health of the option's tool across its live instances.
    pub health: HealthStatus,
}

/// Fallback options keyed by the tool they replace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackGraph {
    options: HashMap<ToolId, Vec<FallbackOption>>,
}

impl FallbackGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the options for `tool_id`.
    pub fn set(&mut self, tool_id: ToolId, options: Vec<FallbackOption>) {
        self.options.insert(tool_id, options);
    }

    /// Builder-style variant of [`FallbackGraph::set`].
    #[must_use]
    pub fn with(mut self, tool_id: ToolId, options: Vec<FallbackOption>) -> Self {
        self.set(tool_id, options);
        self
    }

    /// Options for `tool_id`; empty when none were configured.
    #[must_use]
    pub fn options(&self, tool_id: &ToolId) -> &[FallbackOption] {
        self.options.get(tool_id).map_or(&[], Vec::as_slice)
    }

    /// Number of tools with configured options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// Returns `true` when no options are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_tool_map() {
        let graph: FallbackGraph = serde_json::from_str(
            r#"{"image-editor": [{"toolId": "paint-lite", "priority": 1, "capabilityOverlap": ["crop"]}]}"#,
        )
        .unwrap();

        let options = graph.options(&ToolId::new("image-editor").unwrap());
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].tool_id.as_str(), "paint-lite");
        assert_eq!(options[0].capability_overlap, vec!["crop".to_owned()]);
        assert!(graph.options(&ToolId::new("unknown").unwrap()).is_empty());
    }
}
