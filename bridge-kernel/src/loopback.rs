//! In-process execution contexts for demos and tests.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bridge_channel::loopback::{LoopbackContext, LoopbackPeer, PeerAction, echo_responder};
use bridge_channel::{CommunicationChannel, ContextHandle, Envelope};
use bridge_primitives::{InstanceId, ToolDescriptor};
use tracing::debug;

use crate::{Container, ContextError, ContextFactory, ToolContext};

type Responder = Arc<dyn Fn(&Envelope) -> PeerAction + Send + Sync>;

/// Factory creating [`LoopbackContext`]s answered by a [`LoopbackPeer`].
pub struct LoopbackFactory {
    channel: Arc<CommunicationChannel>,
    origin: String,
    responder: Responder,
    loads: bool,
    reachable: bool,
    created: Mutex<HashMap<InstanceId, Arc<LoopbackContext>>>,
}

impl fmt::Debug for LoopbackFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackFactory")
            .field("origin", &self.origin)
            .field("loads", &self.loads)
            .field("reachable", &self.reachable)
            .finish_non_exhaustive()
    }
}

impl LoopbackFactory {
    /// Creates a factory whose tools answer with
    /// [`echo_responder`] from `origin`.
    #[must_use]
    pub fn new(channel: Arc<CommunicationChannel>, origin: impl Into<String>) -> Self {
        Self {
            channel,
            origin: origin.into(),
            responder: Arc::new(echo_responder),
            loads: true,
            reachable: true,
            created: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the simulated tool behaviour.
    #[must_use]
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Envelope) -> PeerAction + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Makes created contexts never report that they finished loading.
    #[must_use]
    pub fn never_loads(mut self) -> Self {
        self.loads = false;
        self
    }

    /// Makes created contexts unreachable until
    /// [`LoopbackContext::set_reachable`] is called on them.
    #[must_use]
    pub fn starts_unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// The context created for `instance_id`, until it is released.
    #[must_use]
    pub fn context(&self, instance_id: InstanceId) -> Option<Arc<LoopbackContext>> {
        self.created
            .lock()
            .expect("loopback factory poisoned")
            .get(&instance_id)
            .cloned()
    }
}

#[async_trait]
impl ContextFactory for LoopbackFactory {
    async fn create(
        &self,
        instance_id: InstanceId,
        descriptor: &ToolDescriptor,
    ) -> Result<Arc<dyn ToolContext>, ContextError> {
        let sandbox: Vec<&str> = descriptor.config().sandbox().permissions().collect();
        debug!(%instance_id, source = descriptor.source(), ?sandbox, "creating loopback context");

        let (context, inbox) = if self.reachable {
            LoopbackContext::new(self.origin.clone())
        } else {
            LoopbackContext::unreachable(self.origin.clone())
        };
        let responder = Arc::clone(&self.responder);
        let peer = LoopbackPeer::spawn(&self.channel, self.origin.clone(), inbox, move |e: &Envelope| {
            responder(e)
        });
        self.created
            .lock()
            .expect("loopback factory poisoned")
            .insert(instance_id, Arc::clone(&context));

        Ok(Arc::new(LoopbackToolContext {
            context,
            loads: self.loads,
            _peer: peer,
        }))
    }

    fn release(&self, instance_id: InstanceId) {
        self.created
            .lock()
            .expect("loopback factory poisoned")
            .remove(&instance_id);
    }
}

struct LoopbackToolContext {
    context: Arc<LoopbackContext>,
    loads: bool,
    _peer: LoopbackPeer,
}

#[async_trait]
impl ToolContext for LoopbackToolContext {
    fn handle(&self) -> Arc<dyn ContextHandle> {
        self.context.clone()
    }

    async fn loaded(&self) {
        if !self.loads {
            std::future::pending::<()>().await;
        }
    }
}

/// Container that only records which instances are attached.
#[derive(Debug, Default)]
pub struct MemoryContainer {
    attached: Mutex<BTreeSet<InstanceId>>,
}

impl MemoryContainer {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the instance is attached.
    #[must_use]
    pub fn contains(&self, instance_id: InstanceId) -> bool {
        self.attached
            .lock()
            .expect("container poisoned")
            .contains(&instance_id)
    }

    /// Attached instances in id order.
    #[must_use]
    pub fn attached(&self) -> Vec<InstanceId> {
        self.attached
            .lock()
            .expect("container poisoned")
            .iter()
            .copied()
            .collect()
    }
}

impl Container for MemoryContainer {
    fn attach(
        &self,
        instance_id: InstanceId,
        _context: &Arc<dyn ToolContext>,
    ) -> Result<(), ContextError> {
        let mut attached = self.attached.lock().expect("container poisoned");
        if !attached.insert(instance_id) {
            return Err(ContextError::Attach {
                instance_id,
                reason: "already attached".into(),
            });
        }
        Ok(())
    }

    fn detach(&self, instance_id: InstanceId) {
        self.attached
            .lock()
            .expect("container poisoned")
            .remove(&instance_id);
    }
}
