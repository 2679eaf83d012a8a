//! Message-protocol bridge between the host and sandboxed tool instances.
//!
//! The transport underneath is message-only, unordered, and lossy. The
//! [`CommunicationChannel`] layers request/response correlation, per-request
//! timeouts with exponential re-send, and event routing on top of it.

#![warn(missing_docs, clippy::pedantic)]

mod channel;
mod error;
mod events;
pub mod loopback;
mod pending;
mod protocol;
mod transport;

pub use channel::{ChannelConfig, CommunicationChannel, RequestOptions};
pub use error::{ChannelError, ChannelResult};
pub use events::{ChannelEvent, MessageHandler};
pub use protocol::{Envelope, Verb};
pub use transport::{ContextHandle, TransportError};
