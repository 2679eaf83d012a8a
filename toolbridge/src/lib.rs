//! Host-side runtime for embedding third-party tools in isolated contexts.
//!
//! Depend on this crate via `cargo add toolbridge`. It bundles the internal
//! runtime crates behind feature flags so hosts can enable only the layers
//! they use. With the default `runtime` feature, [`BridgeRuntime`] assembles
//! every layer from a [`config::BridgeConfig`].

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use bridge_primitives as primitives;

/// Retry and circuit breaking (enabled by `resilience` feature).
#[cfg(feature = "resilience")]
pub use bridge_resilience as resilience;

/// Request/response messaging with tool contexts (enabled by `channel` feature).
#[cfg(feature = "channel")]
pub use bridge_channel as channel;

/// Health monitoring and fallback selection (enabled by `health` feature).
#[cfg(feature = "health")]
pub use bridge_health as health;

/// Instance lifecycle management (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use bridge_kernel as kernel;

/// Configuration management (enabled by `config` feature).
#[cfg(feature = "config")]
pub use bridge_config as config;

/// Structured logging (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use bridge_telemetry as telemetry;

#[cfg(feature = "runtime")]
mod runtime;

#[cfg(feature = "runtime")]
pub use runtime::{BridgeRuntime, BridgeRuntimeBuilder, RuntimeError};
