//! Observability utilities for the toolbridge runtime.
//!
//! [`init_tracing`] installs the process-wide subscriber and
//! [`EventLogger`] turns the runtime's broadcast events into log records.

#![warn(missing_docs, clippy::pedantic)]

use std::fmt::Debug;

use anyhow::anyhow;
use bridge_channel::ChannelEvent;
use bridge_health::HealthEvent;
use bridge_kernel::ManagerEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Installs a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` when the variable is unset or invalid.
///
/// # Errors
///
/// Fails when `default_directive` does not parse or a global subscriber is
/// already installed.
pub fn init_tracing(default_directive: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Background tasks forwarding runtime events into `tracing`.
///
/// Each stream is drained until its sender side closes. Dropping the logger
/// aborts the tasks.
#[derive(Debug)]
pub struct EventLogger {
    tasks: Vec<JoinHandle<()>>,
}

impl EventLogger {
    /// Spawns one forwarding task per event stream.
    #[must_use]
    pub fn spawn(
        channel: broadcast::Receiver<ChannelEvent>,
        health: broadcast::Receiver<HealthEvent>,
        manager: broadcast::Receiver<ManagerEvent>,
    ) -> Self {
        Self {
            tasks: vec![
                tokio::spawn(forward("channel", channel, log_channel_event)),
                tokio::spawn(forward("health", health, log_health_event)),
                tokio::spawn(forward("manager", manager, log_manager_event)),
            ],
        }
    }

    /// Returns `true` once every stream has closed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Waits until every stream has closed.
    pub async fn join(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn forward<E>(stream: &'static str, mut rx: broadcast::Receiver<E>, log: fn(&E))
where
    E: Clone + Debug + Send,
{
    loop {
        match rx.recv().await {
            Ok(event) => log(&event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(stream, skipped, "event logger fell behind");
            }
            Err(RecvError::Closed) => {
                debug!(stream, "event stream closed");
                break;
            }
        }
    }
}

fn log_channel_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::ToolReady { instance_id, .. } => {
            info!(%instance_id, "tool reported ready");
        }
        ChannelEvent::ToolError { instance_id, error } => {
            warn!(%instance_id, %error, "tool reported an error");
        }
        ChannelEvent::DataChanged { instance_id, .. } => {
            debug!(%instance_id, "tool data changed");
        }
        ChannelEvent::CapabilityCompleted { instance_id, .. } => {
            debug!(%instance_id, "capability completed");
        }
        ChannelEvent::ProgressUpdate { instance_id, payload } => {
            debug!(%instance_id, ?payload, "progress update");
        }
    }
}

fn log_health_event(event: &HealthEvent) {
    match event {
        HealthEvent::HealthCheckFailed {
            instance_id,
            tool_id,
            consecutive_failures,
            error,
        } => {
            warn!(%instance_id, %tool_id, consecutive_failures, %error, "health check failed");
        }
        HealthEvent::FallbackTriggered {
            failed_instance_id,
            failed_tool_id,
            fallback_tool_id,
        } => {
            info!(
                %failed_instance_id,
                %failed_tool_id,
                %fallback_tool_id,
                "fallback selected"
            );
        }
        HealthEvent::NoFallbackAvailable {
            instance_id,
            tool_id,
        } => {
            error!(%instance_id, %tool_id, "no healthy fallback available");
        }
    }
}

fn log_manager_event(event: &ManagerEvent) {
    match event {
        ManagerEvent::InstanceLoaded {
            instance_id,
            tool_id,
        } => info!(%instance_id, %tool_id, "instance loaded"),
        ManagerEvent::InstanceUnloaded {
            instance_id,
            tool_id,
        } => info!(%instance_id, %tool_id, "instance unloaded"),
        ManagerEvent::InstanceError {
            instance_id,
            tool_id,
            reason,
        } => error!(%instance_id, %tool_id, %reason, "instance failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_primitives::{InstanceId, ToolId};

    #[tokio::test]
    async fn logger_drains_until_every_stream_closes() {
        let (channel_tx, channel_rx) = broadcast::channel(4);
        let (health_tx, health_rx) = broadcast::channel(4);
        let (manager_tx, manager_rx) = broadcast::channel(4);
        let logger = EventLogger::spawn(channel_rx, health_rx, manager_rx);

        let instance_id = InstanceId::random();
        let tool_id = ToolId::new("viewer").unwrap();
        channel_tx
            .send(ChannelEvent::ToolError {
                instance_id,
                error: "boom".into(),
            })
            .unwrap();
        health_tx
            .send(HealthEvent::NoFallbackAvailable {
                instance_id,
                tool_id: tool_id.clone(),
            })
            .unwrap();
        manager_tx
            .send(ManagerEvent::InstanceLoaded {
                instance_id,
                tool_id,
            })
            .unwrap();

        drop(channel_tx);
        drop(health_tx);
        drop(manager_tx);
        logger.join().await;
    }

    #[tokio::test]
    async fn lagging_does_not_stop_the_logger() {
        let (channel_tx, channel_rx) = broadcast::channel(1);
        let (_health_tx, health_rx) = broadcast::channel::<HealthEvent>(1);
        let (_manager_tx, manager_rx) = broadcast::channel::<ManagerEvent>(1);

        let instance_id = InstanceId::random();
        for _ in 0..4 {
            channel_tx
                .send(ChannelEvent::DataChanged {
                    instance_id,
                    payload: None,
                })
                .unwrap();
        }
        let logger = EventLogger::spawn(channel_rx, health_rx, manager_rx);
        tokio::task::yield_now().await;
        assert!(!logger.is_finished());
    }
}
