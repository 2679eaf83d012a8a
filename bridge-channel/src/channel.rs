//! Per-instance sessions, request correlation, and inbound routing.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bridge_primitives::{Capability, InstanceId, ToolDescriptor, ToolId};
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::pending::{PendingGuard, PendingTable};
use crate::{
    ChannelError, ChannelEvent, ChannelResult, ContextHandle, Envelope, MessageHandler, Verb,
};

/// Timeout and re-send bound applied to a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    timeout: Duration,
    max_retries: u32,
}

impl RequestOptions {
    /// Creates request options.
    #[must_use]
    pub const fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
        }
    }

    /// How long each attempt waits for a response.
    #[must_use]
    pub const fn timeout(self) -> Duration {
        self.timeout
    }

    /// Re-sends allowed after the first attempt.
    #[must_use]
    pub const fn max_retries(self) -> u32 {
        self.max_retries
    }

    /// Returns a copy with a different per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), 3)
    }
}

/// Configuration for [`CommunicationChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    ready_timeout: Duration,
    request: RequestOptions,
    ping: RequestOptions,
    retry_delay: Duration,
    cleanup_timeout: Duration,
    allowed_origins: Vec<String>,
    event_capacity: NonZeroUsize,
}

impl ChannelConfig {
    /// Bound on waiting for a new context to become reachable.
    #[must_use]
    pub const fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Default options for capability calls and data transfers.
    #[must_use]
    pub const fn request(&self) -> RequestOptions {
        self.request
    }

    /// Options for liveness pings.
    #[must_use]
    pub const fn ping(&self) -> RequestOptions {
        self.ping
    }

    /// Base delay before a re-send; doubles with every retry.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Bound on the best-effort cleanup request sent on destroy.
    #[must_use]
    pub const fn cleanup_timeout(&self) -> Duration {
        self.cleanup_timeout
    }

    /// Origins inbound messages are accepted from; empty accepts all.
    #[must_use]
    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    /// Capacity of the event broadcast buffer.
    #[must_use]
    pub const fn event_capacity(&self) -> NonZeroUsize {
        self.event_capacity
    }

    /// Sets the readiness bound.
    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Sets the default request options.
    #[must_use]
    pub const fn with_request_options(mut self, options: RequestOptions) -> Self {
        self.request = options;
        self
    }

    /// Sets the ping options.
    #[must_use]
    pub const fn with_ping_options(mut self, options: RequestOptions) -> Self {
        self.ping = options;
        self
    }

    /// Sets the base re-send delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the cleanup bound.
    #[must_use]
    pub const fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Restricts inbound messages to the given origins.
    #[must_use]
    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the event buffer capacity.
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            request: RequestOptions::default(),
            ping: RequestOptions::new(Duration::from_secs(5), 0),
            retry_delay: Duration::from_secs(1),
            cleanup_timeout: Duration::from_secs(5),
            allowed_origins: Vec::new(),
            event_capacity: NonZeroUsize::new(256).expect("non-zero"),
        }
    }
}

struct Session {
    handle: Arc<dyn ContextHandle>,
    tool_id: ToolId,
    request_timeout: Option<Duration>,
}

/// One logical connection per tool instance over a message-only transport.
///
/// Requests are correlated by message id and re-sent with exponential backoff
/// when the peer stays silent. Unsolicited tool messages are published as
/// [`ChannelEvent`]s and handed to handlers registered per verb.
pub struct CommunicationChannel {
    config: ChannelConfig,
    sessions: RwLock<HashMap<InstanceId, Session>>,
    pending: PendingTable,
    handlers: RwLock<HashMap<Verb, Vec<Arc<dyn MessageHandler>>>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl CommunicationChannel {
    /// Creates a channel with no sessions.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity().get());
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            pending: PendingTable::default(),
            handlers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Returns the channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Opens a session for `instance_id` and sends `initialize`.
    ///
    /// Waits for the context to become reachable first. The `initialize`
    /// message carries the tool id, its configuration, and its capability
    /// list; no response is awaited.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InstanceReadyTimeout`] when the context is not
    /// reachable within the configured bound, [`ChannelError::InstanceExists`]
    /// when the instance already has a session (which is left untouched), and
    /// [`ChannelError::Transport`] when `initialize` cannot be posted.
    pub async fn setup_instance(
        &self,
        instance_id: InstanceId,
        handle: Arc<dyn ContextHandle>,
        descriptor: &ToolDescriptor,
    ) -> ChannelResult<()> {
        let ready_timeout = self.config.ready_timeout;
        if timeout(ready_timeout, handle.reachable()).await.is_err() {
            warn!(%instance_id, ?ready_timeout, "instance never became reachable");
            return Err(ChannelError::InstanceReadyTimeout {
                instance_id,
                timeout: ready_timeout,
            });
        }

        {
            let mut sessions = self.sessions.write().expect("session table poisoned");
            match sessions.entry(instance_id) {
                Entry::Occupied(existing) => {
                    warn!(
                        %instance_id,
                        tool_id = %existing.get().tool_id,
                        "instance already has a channel session"
                    );
                    return Err(ChannelError::InstanceExists { instance_id });
                }
                Entry::Vacant(slot) => {
                    slot.insert(Session {
                        handle: Arc::clone(&handle),
                        tool_id: descriptor.id().clone(),
                        request_timeout: descriptor.config().request_timeout(),
                    });
                }
            }
        }

        let initialize = Envelope::new(
            Verb::Initialize,
            instance_id,
            Some(json!({
                "toolId": descriptor.id(),
                "config": descriptor.config(),
                "capabilities": descriptor.capabilities(),
            })),
        );
        if let Err(source) = handle.post(&initialize) {
            warn!(%instance_id, error = %source, "failed to post initialize");
            self.sessions
                .write()
                .expect("session table poisoned")
                .remove(&instance_id);
            return Err(ChannelError::Transport {
                instance_id,
                source,
            });
        }

        info!(%instance_id, tool_id = %descriptor.id(), "channel session established");
        Ok(())
    }

    /// Sends a request and waits for the correlated response payload.
    ///
    /// Each attempt waits `options.timeout()`. On silence the same envelope
    /// (same message id) is re-posted after `retry_delay * 2^retry`, up to
    /// `options.max_retries()` times; a response arriving during the backoff
    /// still completes the request. A response without payload yields
    /// [`Value::Null`].
    ///
    /// # Errors
    ///
    /// - [`ChannelError::UnknownInstance`] when no session exists.
    /// - [`ChannelError::Transport`] when posting fails; this is not retried.
    /// - [`ChannelError::MessageTimeout`] once every attempt went unanswered.
    /// - [`ChannelError::Remote`] when the response carries `payload.error`.
    /// - [`ChannelError::InstanceDestroyed`] when the instance is torn down
    ///   while the request is pending.
    pub async fn send_request(
        &self,
        instance_id: InstanceId,
        verb: Verb,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> ChannelResult<Value> {
        let envelope = Envelope::new(verb, instance_id, payload);
        let message_id = envelope.message_id();
        let mut completion =
            self.pending
                .register(message_id, instance_id, envelope.verb().clone());
        let _guard = PendingGuard::new(&self.pending, message_id);

        // Looked up after registering so a concurrent destroy either fails the
        // entry or is observed here.
        let handle = self.handle(instance_id)?;

        let mut retry = 0_u32;
        loop {
            if let Err(source) = handle.post(&envelope) {
                warn!(%instance_id, verb = %envelope.verb(), error = %source, "failed to post request");
                return Err(ChannelError::Transport {
                    instance_id,
                    source,
                });
            }

            if let Ok(result) = timeout(options.timeout(), &mut completion).await {
                return settle(instance_id, result);
            }

            if retry >= options.max_retries() {
                warn!(
                    %instance_id,
                    %message_id,
                    verb = %envelope.verb(),
                    attempts = retry + 1,
                    "request timed out"
                );
                return Err(ChannelError::MessageTimeout {
                    instance_id,
                    message_id,
                    verb: envelope.verb().to_string(),
                    attempts: retry + 1,
                });
            }

            let delay = self
                .config
                .retry_delay
                .saturating_mul(2_u32.saturating_pow(retry));
            retry += 1;
            debug!(
                %instance_id,
                %message_id,
                verb = %envelope.verb(),
                retry,
                ?delay,
                "no response; re-sending"
            );
            if let Ok(result) = timeout(delay, &mut completion).await {
                return settle(instance_id, result);
            }
        }
    }

    /// Invokes a capability on the instance.
    ///
    /// Asynchronous capabilities get twice the per-attempt timeout.
    ///
    /// # Errors
    ///
    /// See [`CommunicationChannel::send_request`].
    pub async fn execute_capability(
        &self,
        instance_id: InstanceId,
        capability: &Capability,
        parameters: Value,
    ) -> ChannelResult<Value> {
        let mut options = self.request_options(instance_id)?;
        if capability.is_async() {
            options = options.with_timeout(options.timeout().saturating_mul(2));
        }
        self.send_request(
            instance_id,
            Verb::ExecuteCapability,
            Some(json!({
                "capability": capability.name(),
                "parameters": parameters,
            })),
            options,
        )
        .await
    }

    /// Pushes data into the instance.
    ///
    /// # Errors
    ///
    /// See [`CommunicationChannel::send_request`].
    pub async fn transfer_data(&self, instance_id: InstanceId, data: Value) -> ChannelResult<Value> {
        let options = self.request_options(instance_id)?;
        self.send_request(
            instance_id,
            Verb::DataTransfer,
            Some(json!({ "data": data })),
            options,
        )
        .await
    }

    /// Pings the instance and returns the measured round-trip time.
    ///
    /// # Errors
    ///
    /// See [`CommunicationChannel::send_request`].
    pub async fn ping(&self, instance_id: InstanceId) -> ChannelResult<Duration> {
        let started = Instant::now();
        self.send_request(instance_id, Verb::Ping, None, self.config.ping)
            .await?;
        Ok(started.elapsed())
    }

    /// Tears down the session for `instance_id`.
    ///
    /// A `cleanup` request is attempted first and its failure is only logged.
    /// Every request still pending for the instance then fails with
    /// [`ChannelError::InstanceDestroyed`]. Unknown instances are ignored.
    pub async fn destroy_instance(&self, instance_id: InstanceId) {
        if !self.has_instance(instance_id) {
            debug!(%instance_id, "destroy requested for unknown instance");
            return;
        }

        let cleanup = RequestOptions::new(self.config.cleanup_timeout, 0);
        if let Err(err) = self
            .send_request(instance_id, Verb::Cleanup, None, cleanup)
            .await
        {
            debug!(%instance_id, error = %err, "cleanup request failed");
        }

        self.sessions
            .write()
            .expect("session table poisoned")
            .remove(&instance_id);
        let failed = self.pending.fail_instance(instance_id);
        info!(%instance_id, failed_requests = failed, "channel session destroyed");
    }

    /// Entry point for raw messages arriving from any child context.
    ///
    /// Messages from origins outside the allow-list and malformed messages
    /// are dropped.
    pub fn receive(&self, origin: &str, raw: &[u8]) {
        if !self.origin_allowed(origin) {
            debug!(origin, "message from disallowed origin dropped");
            return;
        }
        match serde_json::from_slice::<Envelope>(raw) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(err) => debug!(origin, error = %err, "malformed message dropped"),
        }
    }

    /// Registers a handler for inbound messages with the given verb.
    pub fn register_handler(&self, verb: Verb, handler: impl MessageHandler + 'static) {
        let mut handlers = self.handlers.write().expect("handler table poisoned");
        handlers.entry(verb).or_default().push(Arc::new(handler));
    }

    /// Subscribes to unsolicited tool events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Returns `true` when a session exists for the instance.
    #[must_use]
    pub fn has_instance(&self, instance_id: InstanceId) -> bool {
        self.sessions
            .read()
            .expect("session table poisoned")
            .contains_key(&instance_id)
    }

    /// Instances with an open session.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.sessions
            .read()
            .expect("session table poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Tool the instance was set up for.
    #[must_use]
    pub fn tool_id(&self, instance_id: InstanceId) -> Option<ToolId> {
        self.sessions
            .read()
            .expect("session table poisoned")
            .get(&instance_id)
            .map(|session| session.tool_id.clone())
    }

    /// Number of requests awaiting a response from the instance.
    #[must_use]
    pub fn pending_count(&self, instance_id: InstanceId) -> usize {
        self.pending.count_for(instance_id)
    }

    /// Number of requests awaiting a response across all instances.
    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.pending.len()
    }

    fn dispatch(&self, envelope: &Envelope) {
        let instance_id = envelope.instance_id();

        if envelope.verb().is_response() {
            let result = match envelope.error() {
                Some(reason) => Err(ChannelError::Remote {
                    instance_id,
                    reason,
                }),
                None => Ok(envelope.payload().cloned().unwrap_or(Value::Null)),
            };
            if self
                .pending
                .complete(envelope.message_id(), instance_id, result)
                .is_none()
            {
                debug!(
                    %instance_id,
                    message_id = %envelope.message_id(),
                    verb = %envelope.verb(),
                    "unmatched response discarded"
                );
            }
            return;
        }

        let Some(handle) = self.session_handle(instance_id) else {
            debug!(%instance_id, verb = %envelope.verb(), "message for unknown instance dropped");
            return;
        };

        let payload = envelope.payload().cloned();
        match envelope.verb() {
            Verb::HealthCheck => {
                let reply = envelope.reply(Some(json!({ "status": "ok" })));
                if let Err(err) = handle.post(&reply) {
                    debug!(%instance_id, error = %err, "failed to answer health check");
                }
            }
            Verb::ToolReady => self.publish(ChannelEvent::ToolReady {
                instance_id,
                payload,
            }),
            Verb::ToolError => {
                let error = envelope
                    .error()
                    .unwrap_or_else(|| "unspecified tool error".to_owned());
                warn!(%instance_id, %error, "tool reported an error");
                self.publish(ChannelEvent::ToolError { instance_id, error });
            }
            Verb::DataChanged => self.publish(ChannelEvent::DataChanged {
                instance_id,
                payload,
            }),
            Verb::CapabilityCompleted => self.publish(ChannelEvent::CapabilityCompleted {
                instance_id,
                payload,
            }),
            Verb::ProgressUpdate => self.publish(ChannelEvent::ProgressUpdate {
                instance_id,
                payload,
            }),
            _ => {}
        }

        let handlers = {
            let handlers = self.handlers.read().expect("handler table poisoned");
            handlers.get(envelope.verb()).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler.handle(envelope);
        }
    }

    fn publish(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.config.allowed_origins.is_empty()
            || self.config.allowed_origins.iter().any(|o| o == origin)
    }

    fn session_handle(&self, instance_id: InstanceId) -> Option<Arc<dyn ContextHandle>> {
        self.sessions
            .read()
            .expect("session table poisoned")
            .get(&instance_id)
            .map(|session| Arc::clone(&session.handle))
    }

    fn handle(&self, instance_id: InstanceId) -> ChannelResult<Arc<dyn ContextHandle>> {
        self.session_handle(instance_id)
            .ok_or(ChannelError::UnknownInstance { instance_id })
    }

    fn request_options(&self, instance_id: InstanceId) -> ChannelResult<RequestOptions> {
        let sessions = self.sessions.read().expect("session table poisoned");
        let session = sessions
            .get(&instance_id)
            .ok_or(ChannelError::UnknownInstance { instance_id })?;
        let defaults = self.config.request;
        Ok(defaults.with_timeout(session.request_timeout.unwrap_or(defaults.timeout())))
    }
}

impl Default for CommunicationChannel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl fmt::Debug for CommunicationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sessions = self.sessions.read().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("CommunicationChannel")
            .field("config", &self.config)
            .field("sessions", &sessions)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn settle(
    instance_id: InstanceId,
    received: Result<ChannelResult<Value>, oneshot::error::RecvError>,
) -> ChannelResult<Value> {
    // The sender only disappears without a value when the entry was torn down.
    received.unwrap_or(Err(ChannelError::InstanceDestroyed { instance_id }))
}
