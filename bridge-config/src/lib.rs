//! Configuration management for the toolbridge runtime.
//!
//! Configuration is JSON. Every field has a default, so an empty object is a
//! valid configuration; durations are expressed in milliseconds.

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use schema::{
    BridgeConfig, ChannelSettings, CircuitSettings, FallbackSettings, HealthSettings,
    ManagerSettings, RetrySettings, TelemetrySettings,
};
