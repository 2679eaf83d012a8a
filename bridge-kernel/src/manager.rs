//! Owner of every loaded tool instance.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bridge_channel::{ChannelResult, CommunicationChannel};
use bridge_health::{FallbackCandidate, HealthEvent, HealthMonitor, HealthRecord};
use bridge_primitives::{InstanceId, ToolDescriptor, ToolId};
use bridge_resilience::{CircuitBreakerConfig, CircuitError, RetryExecutor, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    Container, ContextFactory, DataTransformer, InstanceStatus, Lifecycle, LifecycleEvent,
    ManagerError, ManagerResult, PassthroughTransformer, ToolCatalog, ToolContext,
};

/// Configuration for [`IntegrationManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    load_timeout: Duration,
    circuit: CircuitBreakerConfig,
    retry: Option<RetryPolicy>,
    event_capacity: NonZeroUsize,
}

impl ManagerConfig {
    /// Default bound on a tool finishing its load.
    #[must_use]
    pub const fn load_timeout(&self) -> Duration {
        self.load_timeout
    }

    /// Circuit applied to each instance's calls.
    #[must_use]
    pub const fn circuit(&self) -> CircuitBreakerConfig {
        self.circuit
    }

    /// Retry policy wrapped around circuit-guarded calls, if any.
    #[must_use]
    pub const fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Capacity of the event broadcast buffer.
    #[must_use]
    pub const fn event_capacity(&self) -> NonZeroUsize {
        self.event_capacity
    }

    /// Sets the default load bound.
    #[must_use]
    pub const fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Sets the per-instance circuit.
    #[must_use]
    pub const fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    /// Retries capability calls and data transfers with `policy`.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the event buffer capacity.
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            circuit: CircuitBreakerConfig::default(),
            retry: None,
            event_capacity: NonZeroUsize::new(256).expect("non-zero"),
        }
    }
}

/// Snapshot of a loaded instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInstance {
    /// Unique per load.
    pub instance_id: InstanceId,
    /// Tool the instance runs.
    pub tool_id: ToolId,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// When the load started.
    pub created_at: DateTime<Utc>,
    /// When the health monitor last checked the instance.
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Instance notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// An instance finished loading.
    InstanceLoaded {
        /// Loaded instance.
        instance_id: InstanceId,
        /// Tool it runs.
        tool_id: ToolId,
    },
    /// An instance was unloaded.
    InstanceUnloaded {
        /// Unloaded instance.
        instance_id: InstanceId,
        /// Tool it ran.
        tool_id: ToolId,
    },
    /// An instance moved to [`InstanceStatus::Error`].
    InstanceError {
        /// Failing instance.
        instance_id: InstanceId,
        /// Tool it runs.
        tool_id: ToolId,
        /// What went wrong.
        reason: String,
    },
}

struct InstanceEntry {
    lifecycle: Lifecycle,
    descriptor: Arc<ToolDescriptor>,
    created_at: DateTime<Utc>,
    context: Option<Arc<dyn ToolContext>>,
    container: Option<Arc<dyn Container>>,
}

/// Builder for [`IntegrationManager`].
pub struct IntegrationManagerBuilder {
    channel: Arc<CommunicationChannel>,
    monitor: Arc<HealthMonitor>,
    contexts: Arc<dyn ContextFactory>,
    config: ManagerConfig,
    transformer: Arc<dyn DataTransformer>,
    executor: Arc<RetryExecutor>,
    catalog: Option<Arc<dyn ToolCatalog>>,
}

impl IntegrationManagerBuilder {
    /// Overrides the default configuration.
    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the transformer used by [`IntegrationManager::transfer_data`].
    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn DataTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Shares an executor (and thereby its circuits) with other components.
    #[must_use]
    pub fn executor(mut self, executor: Arc<RetryExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the catalog used by [`IntegrationManager::load_from_catalog`].
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn ToolCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Builds the manager.
    #[must_use]
    pub fn build(self) -> IntegrationManager {
        let (events, _) = broadcast::channel(self.config.event_capacity().get());
        IntegrationManager {
            config: self.config,
            channel: self.channel,
            monitor: self.monitor,
            contexts: self.contexts,
            transformer: self.transformer,
            executor: self.executor,
            catalog: self.catalog,
            instances: RwLock::new(HashMap::new()),
            events,
            recovery: Mutex::new(None),
        }
    }
}

/// Loads, tracks, and unloads tool instances.
///
/// Each live instance owns one execution context, one channel session, and
/// one health record; all three are torn down together on unload.
pub struct IntegrationManager {
    config: ManagerConfig,
    channel: Arc<CommunicationChannel>,
    monitor: Arc<HealthMonitor>,
    contexts: Arc<dyn ContextFactory>,
    transformer: Arc<dyn DataTransformer>,
    executor: Arc<RetryExecutor>,
    catalog: Option<Arc<dyn ToolCatalog>>,
    instances: RwLock<HashMap<InstanceId, InstanceEntry>>,
    events: broadcast::Sender<ManagerEvent>,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for IntegrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationManager")
            .field("config", &self.config)
            .field("channel", &self.channel)
            .field("monitor", &self.monitor)
            .field("contexts", &"dyn ContextFactory")
            .field("catalog", &self.catalog.is_some())
            .field(
                "instances",
                &self.instances.read().map(|i| i.len()).unwrap_or_default(),
            )
            .finish_non_exhaustive()
    }
}

impl IntegrationManager {
    /// Starts building a manager over the given components.
    #[must_use]
    pub fn builder(
        channel: Arc<CommunicationChannel>,
        monitor: Arc<HealthMonitor>,
        contexts: Arc<dyn ContextFactory>,
    ) -> IntegrationManagerBuilder {
        IntegrationManagerBuilder {
            channel,
            monitor,
            contexts,
            config: ManagerConfig::default(),
            transformer: Arc::new(PassthroughTransformer),
            executor: Arc::new(RetryExecutor::new()),
            catalog: None,
        }
    }

    /// Loads a tool into a fresh isolated context.
    ///
    /// The instance is tracked as loading from the start. Once the context is
    /// created, attached to `container`, reachable, and loaded, any
    /// `initial_data` is pushed (best effort), the instance is registered with
    /// the health monitor, and it becomes ready.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ToolLoadingTimeout`] when the tool does not load
    /// within the descriptor's load timeout (or the configured default), and
    /// context or channel errors raised while bringing it up. A failed load
    /// leaves the instance tracked with [`InstanceStatus::Error`]. An instance
    /// unloaded before it became ready is released and the load fails, with
    /// [`ManagerError::InstanceNotFound`] unless an earlier error occurred.
    pub async fn load_tool(
        &self,
        descriptor: Arc<ToolDescriptor>,
        container: Arc<dyn Container>,
        initial_data: Option<Value>,
    ) -> ManagerResult<ToolInstance> {
        let instance_id = InstanceId::random();
        let tool_id = descriptor.id().clone();
        {
            let mut instances = self.instances.write().expect("instance table poisoned");
            instances.insert(
                instance_id,
                InstanceEntry {
                    lifecycle: Lifecycle::new(instance_id),
                    descriptor: Arc::clone(&descriptor),
                    created_at: Utc::now(),
                    context: None,
                    container: None,
                },
            );
        }
        info!(%instance_id, %tool_id, version = descriptor.version(), "loading tool");

        if let Err(err) = self
            .bring_up(instance_id, &descriptor, Arc::clone(&container), initial_data)
            .await
        {
            if self.is_tracked(instance_id) {
                warn!(%instance_id, %tool_id, error = %err, "tool failed to load");
                self.fail_instance(instance_id, err.to_string());
            } else {
                debug!(%instance_id, %tool_id, "instance unloaded while loading");
                self.release(instance_id, container.as_ref()).await;
            }
            return Err(err);
        }

        self.monitor.add_instance(instance_id, tool_id.clone());
        let loaded = self.with_entry(instance_id, |entry| {
            entry.lifecycle.transition(LifecycleEvent::Loaded)?;
            Ok(self.snapshot(instance_id, entry))
        });
        match loaded {
            Ok(instance) => {
                info!(%instance_id, %tool_id, "tool ready");
                self.publish(ManagerEvent::InstanceLoaded {
                    instance_id,
                    tool_id,
                });
                Ok(instance)
            }
            Err(err) => {
                debug!(%instance_id, %tool_id, "instance unloaded while loading");
                self.release(instance_id, container.as_ref()).await;
                Err(err)
            }
        }
    }

    /// Resolves `tool_id` through the catalog and loads it.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::UnknownTool`] when no catalog is configured or
    /// it has no such tool, plus everything [`IntegrationManager::load_tool`]
    /// returns.
    pub async fn load_from_catalog(
        &self,
        tool_id: &ToolId,
        container: Arc<dyn Container>,
        initial_data: Option<Value>,
    ) -> ManagerResult<ToolInstance> {
        let descriptor = match &self.catalog {
            Some(catalog) => catalog.descriptor(tool_id).await,
            None => None,
        }
        .ok_or_else(|| ManagerError::UnknownTool {
            tool_id: tool_id.clone(),
        })?;
        self.load_tool(descriptor, container, initial_data).await
    }

    /// Unloads an instance. Returns `false` for unknown instances.
    pub async fn unload_tool(&self, instance_id: InstanceId) -> bool {
        let entry = self
            .instances
            .write()
            .expect("instance table poisoned")
            .remove(&instance_id);
        let Some(mut entry) = entry else {
            debug!(%instance_id, "unload requested for unknown instance");
            return false;
        };

        self.channel.destroy_instance(instance_id).await;
        self.monitor.remove_instance(instance_id);
        if let Some(container) = entry.container.take() {
            container.detach(instance_id);
        }
        entry.context.take();
        self.contexts.release(instance_id);
        self.executor.reset_circuit(&circuit_key(instance_id));
        if let Err(err) = entry.lifecycle.transition(LifecycleEvent::Destroy) {
            warn!(%instance_id, error = %err, "unexpected lifecycle state during unload");
        }

        let tool_id = entry.descriptor.id().clone();
        info!(%instance_id, %tool_id, "tool unloaded");
        self.publish(ManagerEvent::InstanceUnloaded {
            instance_id,
            tool_id,
        });
        true
    }

    /// Invokes a declared capability on a ready instance.
    ///
    /// The call runs behind the instance's circuit breaker, retried per the
    /// configured policy when one is set.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::InstanceNotFound`] for unknown instances.
    /// - [`ManagerError::InstanceNotReady`] unless the instance is ready.
    /// - [`ManagerError::CapabilityNotFound`] when the tool does not declare it.
    /// - [`ManagerError::CircuitOpen`] while the instance's circuit is open.
    /// - [`ManagerError::Channel`] when the call itself fails.
    pub async fn execute_capability(
        &self,
        instance_id: InstanceId,
        capability: &str,
        parameters: Value,
    ) -> ManagerResult<Value> {
        let (descriptor, status) = self.entry_view(instance_id)?;
        if status != InstanceStatus::Ready {
            return Err(ManagerError::InstanceNotReady {
                instance_id,
                status,
            });
        }
        let capability = descriptor
            .capability(capability)
            .cloned()
            .ok_or_else(|| ManagerError::CapabilityNotFound {
                instance_id,
                capability: capability.to_owned(),
            })?;

        self.call(instance_id, || {
            self.channel
                .execute_capability(instance_id, &capability, parameters.clone())
        })
        .await
    }

    /// Converts data from the source tool's format and pushes it into the
    /// target instance.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::InstanceNotFound`] when either instance is
    /// unknown, [`ManagerError::Transform`] when conversion fails, and the
    /// circuit and channel errors of [`IntegrationManager::execute_capability`].
    pub async fn transfer_data(
        &self,
        source_id: InstanceId,
        target_id: InstanceId,
        data: Value,
    ) -> ManagerResult<Value> {
        let (source, _) = self.entry_view(source_id)?;
        let (target, _) = self.entry_view(target_id)?;

        let converted = self.transformer.transform(data, &source, &target).await?;
        debug!(%source_id, %target_id, "transferring data between instances");

        self.call(target_id, || {
            self.channel.transfer_data(target_id, converted.clone())
        })
        .await
    }

    /// Starts reacting to health failures. Returns `false` if already running.
    ///
    /// On every [`HealthEvent::HealthCheckFailed`] the instance is pinged once
    /// more; if that also fails it moves to [`InstanceStatus::Error`] and
    /// [`ManagerEvent::InstanceError`] is published. Fallback substitution is
    /// left to subscribers of the monitor's events.
    pub fn start_recovery(self: &Arc<Self>) -> bool {
        let mut recovery = self.recovery.lock().expect("recovery worker poisoned");
        if recovery.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let events = self.monitor.subscribe();
        let manager = Arc::downgrade(self);
        *recovery = Some(tokio::spawn(run_recovery_loop(manager, events)));
        debug!("instance recovery started");
        true
    }

    /// Stops reacting to health failures.
    pub fn stop_recovery(&self) -> bool {
        let handle = self.recovery.lock().expect("recovery worker poisoned").take();
        handle.is_some_and(|handle| {
            handle.abort();
            true
        })
    }

    /// Current status of an instance.
    #[must_use]
    pub fn get_instance_status(&self, instance_id: InstanceId) -> Option<InstanceStatus> {
        self.instances
            .read()
            .expect("instance table poisoned")
            .get(&instance_id)
            .map(|entry| entry.lifecycle.status())
    }

    /// Snapshot of one instance.
    #[must_use]
    pub fn instance(&self, instance_id: InstanceId) -> Option<ToolInstance> {
        self.instances
            .read()
            .expect("instance table poisoned")
            .get(&instance_id)
            .map(|entry| self.snapshot(instance_id, entry))
    }

    /// Snapshot of every tracked instance.
    #[must_use]
    pub fn get_all_instances(&self) -> Vec<ToolInstance> {
        self.instances
            .read()
            .expect("instance table poisoned")
            .iter()
            .map(|(id, entry)| self.snapshot(*id, entry))
            .collect()
    }

    /// Fallback candidates for `tool_id`, as ranked by the health monitor.
    #[must_use]
    pub fn fallback_options(&self, tool_id: &ToolId) -> Vec<FallbackCandidate> {
        self.monitor.get_fallback_options(tool_id)
    }

    /// Health records of every monitored instance.
    #[must_use]
    pub fn all_health_statuses(&self) -> HashMap<InstanceId, HealthRecord> {
        self.monitor.get_all_health_statuses()
    }

    /// Subscribes to instance events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// The channel instances are reached through.
    #[must_use]
    pub fn channel(&self) -> &Arc<CommunicationChannel> {
        &self.channel
    }

    /// The monitor instances are registered with.
    #[must_use]
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// The executor owning the per-instance circuits.
    #[must_use]
    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    /// Stops background work and unloads every instance.
    pub async fn shutdown(&self) {
        self.stop_recovery();
        self.monitor.stop_monitoring();
        let instance_ids: Vec<InstanceId> = self
            .instances
            .read()
            .expect("instance table poisoned")
            .keys()
            .copied()
            .collect();
        for instance_id in instance_ids {
            self.unload_tool(instance_id).await;
        }
        info!("integration manager shut down");
    }

    async fn bring_up(
        &self,
        instance_id: InstanceId,
        descriptor: &ToolDescriptor,
        container: Arc<dyn Container>,
        initial_data: Option<Value>,
    ) -> ManagerResult<()> {
        let context = self.contexts.create(instance_id, descriptor).await?;
        container.attach(instance_id, &context)?;
        self.with_entry(instance_id, |entry| {
            entry.context = Some(Arc::clone(&context));
            entry.container = Some(Arc::clone(&container));
            Ok(())
        })?;

        self.channel
            .setup_instance(instance_id, context.handle(), descriptor)
            .await?;
        if !self.is_tracked(instance_id) {
            return Err(ManagerError::InstanceNotFound { instance_id });
        }

        let load_timeout = descriptor
            .config()
            .load_timeout()
            .unwrap_or(self.config.load_timeout);
        if timeout(load_timeout, context.loaded()).await.is_err() {
            return Err(ManagerError::ToolLoadingTimeout {
                instance_id,
                tool_id: descriptor.id().clone(),
                timeout: load_timeout,
            });
        }

        if let Some(data) = initial_data {
            if let Err(err) = self.channel.transfer_data(instance_id, data).await {
                warn!(%instance_id, error = %err, "initial data transfer failed");
            }
        }
        Ok(())
    }

    /// Drops everything a load acquired for an instance that is no longer
    /// tracked.
    async fn release(&self, instance_id: InstanceId, container: &dyn Container) {
        self.channel.destroy_instance(instance_id).await;
        self.monitor.remove_instance(instance_id);
        container.detach(instance_id);
        self.contexts.release(instance_id);
    }

    fn is_tracked(&self, instance_id: InstanceId) -> bool {
        self.instances
            .read()
            .expect("instance table poisoned")
            .contains_key(&instance_id)
    }

    async fn recover(&self, instance_id: InstanceId) {
        if self.get_instance_status(instance_id) != Some(InstanceStatus::Ready) {
            return;
        }
        match self.channel.ping(instance_id).await {
            Ok(latency) => {
                debug!(%instance_id, ?latency, "instance answered recovery ping");
            }
            Err(err) => {
                warn!(%instance_id, error = %err, "recovery ping failed");
                self.fail_instance(instance_id, err.to_string());
            }
        }
    }

    fn fail_instance(&self, instance_id: InstanceId, reason: String) {
        let failed = self.with_entry(instance_id, |entry| {
            entry.lifecycle.transition(LifecycleEvent::Fail)?;
            Ok(entry.descriptor.id().clone())
        });
        match failed {
            Ok(tool_id) => self.publish(ManagerEvent::InstanceError {
                instance_id,
                tool_id,
                reason,
            }),
            Err(err) => debug!(%instance_id, error = %err, "instance could not be marked failed"),
        }
    }

    async fn call<F, Fut>(&self, instance_id: InstanceId, op: F) -> ManagerResult<Value>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ChannelResult<Value>>,
    {
        match &self.config.retry {
            None => self.guarded(instance_id, &op).await,
            Some(policy) => self
                .executor
                .execute_with_retry(policy, || self.guarded(instance_id, &op))
                .await
                .into_result(),
        }
    }

    async fn guarded<F, Fut>(&self, instance_id: InstanceId, op: F) -> ManagerResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ChannelResult<Value>>,
    {
        self.executor
            .execute_with_circuit_breaker(self.config.circuit, &circuit_key(instance_id), op)
            .await
            .map_err(|err| match err {
                CircuitError::Open { .. } => ManagerError::CircuitOpen { instance_id },
                CircuitError::Inner(err) => ManagerError::Channel(err),
            })
    }

    fn entry_view(
        &self,
        instance_id: InstanceId,
    ) -> ManagerResult<(Arc<ToolDescriptor>, InstanceStatus)> {
        self.instances
            .read()
            .expect("instance table poisoned")
            .get(&instance_id)
            .map(|entry| (Arc::clone(&entry.descriptor), entry.lifecycle.status()))
            .ok_or(ManagerError::InstanceNotFound { instance_id })
    }

    fn with_entry<R>(
        &self,
        instance_id: InstanceId,
        f: impl FnOnce(&mut InstanceEntry) -> ManagerResult<R>,
    ) -> ManagerResult<R> {
        let mut instances = self.instances.write().expect("instance table poisoned");
        let entry = instances
            .get_mut(&instance_id)
            .ok_or(ManagerError::InstanceNotFound { instance_id })?;
        f(entry)
    }

    fn snapshot(&self, instance_id: InstanceId, entry: &InstanceEntry) -> ToolInstance {
        ToolInstance {
            instance_id,
            tool_id: entry.descriptor.id().clone(),
            status: entry.lifecycle.status(),
            created_at: entry.created_at,
            last_health_check: self
                .monitor
                .health_record(instance_id)
                .and_then(|record| record.last_checked),
        }
    }

    fn publish(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for IntegrationManager {
    fn drop(&mut self) {
        if let Ok(recovery) = self.recovery.get_mut() {
            if let Some(handle) = recovery.take() {
                handle.abort();
            }
        }
    }
}

fn circuit_key(instance_id: InstanceId) -> String {
    format!("instance:{instance_id}")
}

async fn run_recovery_loop(
    manager: Weak<IntegrationManager>,
    mut events: broadcast::Receiver<HealthEvent>,
) {
    loop {
        match events.recv().await {
            Ok(HealthEvent::HealthCheckFailed { instance_id, .. }) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.recover(instance_id).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "recovery fell behind health events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
