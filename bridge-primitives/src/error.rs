//! Shared error definitions for bridge primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the bridge primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// An instance or message identifier could not be parsed.
    #[error("invalid identifier: {source}")]
    InvalidUuid {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// Tool identifier failed validation.
    #[error("invalid tool id `{id}`: {reason}")]
    InvalidToolId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Capability definition failed validation.
    #[error("invalid capability: {reason}")]
    InvalidCapability {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Tool descriptor failed validation.
    #[error("invalid tool descriptor: {reason}")]
    InvalidDescriptor {
        /// Human-readable reason for rejection.
        reason: String,
    },
}

impl Error {
    pub(crate) fn capability(reason: impl Into<String>) -> Self {
        Self::InvalidCapability {
            reason: reason.into(),
        }
    }

    pub(crate) fn descriptor(reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            reason: reason.into(),
        }
    }
}
