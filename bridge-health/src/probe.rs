//! Liveness probing seam.

use std::time::Duration;

use async_trait::async_trait;
use bridge_channel::{ChannelResult, CommunicationChannel};
use bridge_primitives::InstanceId;

/// Measures round-trip latency to an instance.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Pings the instance once.
    ///
    /// # Errors
    ///
    /// Returns the channel error that prevented a response.
    async fn ping(&self, instance_id: InstanceId) -> ChannelResult<Duration>;
}

#[async_trait]
impl Probe for CommunicationChannel {
    async fn ping(&self, instance_id: InstanceId) -> ChannelResult<Duration> {
        CommunicationChannel::ping(self, instance_id).await
    }
}
