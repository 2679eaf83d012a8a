//! Lifecycle state machine for tool instances.

use std::fmt;

use bridge_primitives::InstanceId;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// States a tool instance can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Context created; waiting for the tool to finish loading.
    Loading,
    /// Accepting capability calls.
    Ready,
    /// Failed to load or stopped answering.
    Error,
    /// Torn down; no further work is accepted.
    Destroyed,
}

impl InstanceStatus {
    /// Returns the lowercase name used in logs and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
        }
    }

    /// Returns `true` once the instance has been destroyed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that trigger lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The tool finished loading.
    Loaded,
    /// Loading failed or the instance stopped answering.
    Fail,
    /// The instance is being unloaded.
    Destroy,
}

/// Lifecycle state manager for one instance.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    instance_id: InstanceId,
    status: InstanceStatus,
}

impl Lifecycle {
    /// Starts a lifecycle in [`InstanceStatus::Loading`].
    #[must_use]
    pub const fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            status: InstanceStatus::Loading,
        }
    }

    /// Returns the owning instance identifier.
    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Applies a lifecycle event, returning the resulting status.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// allowed from the current status.
    pub fn transition(&mut self, event: LifecycleEvent) -> LifecycleResult<InstanceStatus> {
        let next = match (self.status, event) {
            (InstanceStatus::Loading, LifecycleEvent::Loaded) => Some(InstanceStatus::Ready),
            (
                InstanceStatus::Loading | InstanceStatus::Ready | InstanceStatus::Error,
                LifecycleEvent::Fail,
            ) => Some(InstanceStatus::Error),
            (_, LifecycleEvent::Destroy) => Some(InstanceStatus::Destroyed),
            _ => None,
        };

        let Some(next_status) = next else {
            return Err(LifecycleError::InvalidTransition {
                instance_id: self.instance_id,
                from: self.status,
                event,
            });
        };

        if next_status != self.status {
            debug!(
                instance_id = %self.instance_id,
                from = %self.status,
                to = %next_status,
                ?event,
                "instance lifecycle transition"
            );
            self.status = next_status;
        }

        Ok(self.status)
    }
}

/// Errors emitted by the lifecycle controller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transition was not permitted from the current status.
    #[error("invalid lifecycle transition from {from} via {event:?} for instance {instance_id}")]
    InvalidTransition {
        /// Instance whose transition failed.
        instance_id: InstanceId,
        /// Status prior to the attempted transition.
        from: InstanceStatus,
        /// Event that triggered the failure.
        event: LifecycleEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_then_destroy() {
        let mut lifecycle = Lifecycle::new(InstanceId::random());

        assert_eq!(lifecycle.status(), InstanceStatus::Loading);
        lifecycle.transition(LifecycleEvent::Loaded).unwrap();
        assert_eq!(lifecycle.status(), InstanceStatus::Ready);
        lifecycle.transition(LifecycleEvent::Destroy).unwrap();
        assert!(lifecycle.status().is_terminal());
    }

    #[test]
    fn failures_from_loading_and_ready() {
        let mut loading = Lifecycle::new(InstanceId::random());
        loading.transition(LifecycleEvent::Fail).unwrap();
        assert_eq!(loading.status(), InstanceStatus::Error);
        // Repeated failures keep the instance in error.
        loading.transition(LifecycleEvent::Fail).unwrap();
        assert_eq!(loading.status(), InstanceStatus::Error);

        let mut ready = Lifecycle::new(InstanceId::random());
        ready.transition(LifecycleEvent::Loaded).unwrap();
        ready.transition(LifecycleEvent::Fail).unwrap();
        assert_eq!(ready.status(), InstanceStatus::Error);
        ready.transition(LifecycleEvent::Destroy).unwrap();
        assert_eq!(ready.status(), InstanceStatus::Destroyed);
    }

    #[test]
    fn destroyed_is_terminal() {
        let instance_id = InstanceId::random();
        let mut lifecycle = Lifecycle::new(instance_id);
        lifecycle.transition(LifecycleEvent::Destroy).unwrap();

        let err = lifecycle
            .transition(LifecycleEvent::Loaded)
            .expect_err("destroyed instances cannot load");
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                instance_id,
                from: InstanceStatus::Destroyed,
                event: LifecycleEvent::Loaded,
            }
        );
        assert!(lifecycle.transition(LifecycleEvent::Fail).is_err());
    }

    #[test]
    fn error_cannot_become_ready() {
        let mut lifecycle = Lifecycle::new(InstanceId::random());
        lifecycle.transition(LifecycleEvent::Fail).unwrap();
        assert!(lifecycle.transition(LifecycleEvent::Loaded).is_err());
    }
}
