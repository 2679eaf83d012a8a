//! Instance lifecycle management for embedded, sandboxed tools.
//!
//! [`IntegrationManager`] ties the pieces together: it creates an isolated
//! execution context per instance, opens a channel session to it, registers
//! it with the health monitor, and guards every call with a per-instance
//! circuit breaker.

#![warn(missing_docs, clippy::pedantic)]

mod catalog;
mod context;
mod error;
mod lifecycle;
pub mod loopback;
mod manager;
mod transform;

pub use catalog::{InMemoryCatalog, ToolCatalog};
pub use context::{Container, ContextError, ContextFactory, ToolContext};
pub use error::{ManagerError, ManagerResult};
pub use lifecycle::{InstanceStatus, Lifecycle, LifecycleError, LifecycleEvent, LifecycleResult};
pub use manager::{
    IntegrationManager, IntegrationManagerBuilder, ManagerConfig, ManagerEvent, ToolInstance,
};
pub use transform::{DataTransformer, PassthroughTransformer, TransformError};
