//! Descriptor lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bridge_primitives::{ToolDescriptor, ToolId};

/// Source of tool descriptors.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    /// Looks up the descriptor for `tool_id`.
    async fn descriptor(&self, tool_id: &ToolId) -> Option<Arc<ToolDescriptor>>;
}

/// Catalog backed by an in-memory map.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tools: RwLock<HashMap<ToolId, Arc<ToolDescriptor>>>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a descriptor.
    pub fn insert(&self, descriptor: ToolDescriptor) {
        let mut tools = self.tools.write().expect("catalog poisoned");
        tools.insert(descriptor.id().clone(), Arc::new(descriptor));
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().expect("catalog poisoned").len()
    }

    /// Returns `true` when no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<ToolDescriptor> for InMemoryCatalog {
    fn from_iter<I: IntoIterator<Item = ToolDescriptor>>(iter: I) -> Self {
        let catalog = Self::new();
        for descriptor in iter {
            catalog.insert(descriptor);
        }
        catalog
    }
}

#[async_trait]
impl ToolCatalog for InMemoryCatalog {
    async fn descriptor(&self, tool_id: &ToolId) -> Option<Arc<ToolDescriptor>> {
        self.tools
            .read()
            .expect("catalog poisoned")
            .get(tool_id)
            .cloned()
    }
}
