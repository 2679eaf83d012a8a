//! Health monitoring and fallback resolution for embedded tool instances.
//!
//! [`HealthMonitor`] pings every registered instance through a [`Probe`],
//! classifies the answer by latency, and raises a fallback decision once an
//! instance fails too many checks in a row.

#![warn(missing_docs, clippy::pedantic)]

mod config;
mod error;
mod events;
mod fallback;
mod monitor;
mod probe;
mod record;

pub use config::HealthConfig;
pub use error::{HealthError, HealthResult};
pub use events::HealthEvent;
pub use fallback::{FallbackCandidate, FallbackGraph, FallbackOption};
pub use monitor::HealthMonitor;
pub use probe::Probe;
pub use record::{HealthRecord, HealthStatus};
