//! In-process transport that stands in for a sandboxed child context.
//!
//! [`LoopbackContext`] records everything posted to it and forwards each
//! envelope to an inbox. [`LoopbackPeer`] drains that inbox and answers
//! through [`CommunicationChannel::receive`], exactly like a real tool would
//! from across the isolation boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{CommunicationChannel, ContextHandle, Envelope, TransportError, Verb};

/// Loopback execution context.
#[derive(Debug)]
pub struct LoopbackContext {
    origin: String,
    posted: Mutex<Vec<Envelope>>,
    outbox: mpsc::UnboundedSender<Envelope>,
    reachable: watch::Sender<bool>,
    closed: AtomicBool,
}

impl LoopbackContext {
    /// Creates a reachable context and the inbox its posts land in.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        Self::build(origin.into(), true)
    }

    /// Creates a context that stays unreachable until
    /// [`LoopbackContext::set_reachable`] is called.
    #[must_use]
    pub fn unreachable(
        origin: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        Self::build(origin.into(), false)
    }

    fn build(origin: String, reachable: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let (reachable, _) = watch::channel(reachable);
        let context = Arc::new(Self {
            origin,
            posted: Mutex::new(Vec::new()),
            outbox,
            reachable,
            closed: AtomicBool::new(false),
        });
        (context, inbox)
    }

    /// Origin the simulated tool answers from.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Marks the context reachable or not.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.send_replace(reachable);
    }

    /// Makes every further post fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Every envelope posted so far, oldest first.
    #[must_use]
    pub fn posted(&self) -> Vec<Envelope> {
        self.posted.lock().expect("loopback log poisoned").clone()
    }

    /// Verbs of every envelope posted so far.
    #[must_use]
    pub fn posted_verbs(&self) -> Vec<Verb> {
        self.posted
            .lock()
            .expect("loopback log poisoned")
            .iter()
            .map(|envelope| envelope.verb().clone())
            .collect()
    }
}

#[async_trait]
impl ContextHandle for LoopbackContext {
    fn post(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.posted
            .lock()
            .expect("loopback log poisoned")
            .push(envelope.clone());
        // Nobody draining the inbox is equivalent to a dropped message.
        let _ = self.outbox.send(envelope.clone());
        Ok(())
    }

    async fn reachable(&self) {
        let mut reachable = self.reachable.subscribe();
        let _ = reachable.wait_for(|ready| *ready).await;
    }
}

/// What a simulated tool does with one inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerAction {
    /// Answer immediately with the payload.
    Reply(Value),
    /// Answer immediately with `payload.error`.
    Fail(String),
    /// Answer with the payload after a delay.
    ReplyAfter(Duration, Value),
    /// Stay silent.
    Ignore,
}

/// Background task playing the tool side of a loopback context.
#[derive(Debug)]
pub struct LoopbackPeer {
    task: JoinHandle<()>,
}

impl LoopbackPeer {
    /// Spawns a peer that answers envelopes from `inbox` using `responder`.
    ///
    /// The peer holds the channel weakly and stops once it is dropped.
    pub fn spawn<F>(
        channel: &Arc<CommunicationChannel>,
        origin: impl Into<String>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        responder: F,
    ) -> Self
    where
        F: Fn(&Envelope) -> PeerAction + Send + Sync + 'static,
    {
        let channel = Arc::downgrade(channel);
        let origin: Arc<str> = Arc::from(origin.into());
        let task = tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let reply = match responder(&envelope) {
                    PeerAction::Ignore => continue,
                    PeerAction::Reply(payload) => envelope.reply(Some(payload)),
                    PeerAction::Fail(reason) => envelope.error_reply(reason),
                    PeerAction::ReplyAfter(delay, payload) => {
                        let reply = envelope.reply(Some(payload));
                        let channel = Weak::clone(&channel);
                        let origin = Arc::clone(&origin);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            send_back(&channel, &origin, &reply);
                        });
                        continue;
                    }
                };
                if !send_back(&channel, &origin, &reply) {
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn send_back(channel: &Weak<CommunicationChannel>, origin: &str, envelope: &Envelope) -> bool {
    match channel.upgrade() {
        Some(channel) => {
            deliver(&channel, origin, envelope);
            true
        }
        None => false,
    }
}

/// Serialises `envelope` and feeds it to the channel as if it arrived from
/// `origin`.
pub fn deliver(channel: &CommunicationChannel, origin: &str, envelope: &Envelope) {
    match serde_json::to_vec(envelope) {
        Ok(raw) => channel.receive(origin, &raw),
        Err(err) => warn!(error = %err, "failed to encode loopback envelope"),
    }
}

/// Responder that behaves like a well-mannered tool.
///
/// Capabilities echo their parameters and the remaining requests are
/// acknowledged; `initialize` and events get no answer.
#[must_use]
pub fn echo_responder(envelope: &Envelope) -> PeerAction {
    match envelope.verb() {
        Verb::ExecuteCapability => PeerAction::Reply(
            envelope
                .payload()
                .and_then(|payload| payload.get("parameters"))
                .cloned()
                .unwrap_or(Value::Null),
        ),
        Verb::DataTransfer => PeerAction::Reply(serde_json::json!({ "received": true })),
        Verb::Ping | Verb::Cleanup => PeerAction::Reply(Value::Null),
        _ => PeerAction::Ignore,
    }
}
