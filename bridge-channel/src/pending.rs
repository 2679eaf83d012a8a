//! Bookkeeping for in-flight requests.

use std::collections::HashMap;
use std::sync::Mutex;

use bridge_primitives::{InstanceId, MessageId};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{ChannelError, ChannelResult, Verb};

pub(crate) type Completion = oneshot::Receiver<ChannelResult<Value>>;

#[derive(Debug)]
struct PendingRequest {
    instance_id: InstanceId,
    verb: Verb,
    sender: oneshot::Sender<ChannelResult<Value>>,
}

/// Pending requests keyed by message id.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    inner: Mutex<HashMap<MessageId, PendingRequest>>,
}

impl PendingTable {
    pub(crate) fn register(
        &self,
        message_id: MessageId,
        instance_id: InstanceId,
        verb: Verb,
    ) -> Completion {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock().expect("pending table poisoned");
        inner.insert(
            message_id,
            PendingRequest {
                instance_id,
                verb,
                sender,
            },
        );
        receiver
    }

    /// Completes the request if it is pending and belongs to `instance_id`.
    ///
    /// Returns the verb of the completed request.
    pub(crate) fn complete(
        &self,
        message_id: MessageId,
        instance_id: InstanceId,
        result: ChannelResult<Value>,
    ) -> Option<Verb> {
        let request = {
            let mut inner = self.inner.lock().expect("pending table poisoned");
            match inner.get(&message_id) {
                Some(pending) if pending.instance_id == instance_id => inner.remove(&message_id)?,
                _ => return None,
            }
        };
        // The caller may have stopped waiting; nothing to do then.
        let _ = request.sender.send(result);
        Some(request.verb)
    }

    pub(crate) fn remove(&self, message_id: MessageId) {
        let mut inner = self.inner.lock().expect("pending table poisoned");
        inner.remove(&message_id);
    }

    /// Fails every pending request owned by `instance_id` with
    /// [`ChannelError::InstanceDestroyed`], returning how many were failed.
    pub(crate) fn fail_instance(&self, instance_id: InstanceId) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.inner.lock().expect("pending table poisoned");
            let ids: Vec<MessageId> = inner
                .iter()
                .filter(|(_, pending)| pending.instance_id == instance_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| inner.remove(&id)).collect()
        };

        let count = drained.len();
        for pending in drained {
            let _ = pending
                .sender
                .send(Err(ChannelError::InstanceDestroyed { instance_id }));
        }
        count
    }

    pub(crate) fn count_for(&self, instance_id: InstanceId) -> usize {
        let inner = self.inner.lock().expect("pending table poisoned");
        inner
            .values()
            .filter(|pending| pending.instance_id == instance_id)
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").len()
    }
}

/// Removes a pending entry when the awaiting request future goes away,
/// whether it finished or was cancelled.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    message_id: MessageId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, message_id: MessageId) -> Self {
        Self { table, message_id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.message_id);
    }
}
