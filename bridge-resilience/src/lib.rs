//! Fault-tolerance decorators for fallible asynchronous operations.
//!
//! [`RetryExecutor`] offers two guards: bounded retry with exponential backoff,
//! and a keyed three-state circuit breaker whose state is shared by every
//! caller of the same executor.

#![warn(missing_docs, clippy::pedantic)]

mod circuit;
mod executor;
mod retry;

pub use circuit::{CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use executor::RetryExecutor;
pub use retry::{Classify, RetryError, RetryOutcome, RetryPolicy, RetryResult};
