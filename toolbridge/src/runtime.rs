//! Assembles the runtime layers from configuration.

use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;

use bridge_channel::{ChannelConfig, CommunicationChannel, RequestOptions};
use bridge_config::{BridgeConfig, ConfigError};
use bridge_health::{
    FallbackGraph, FallbackOption, HealthConfig, HealthError, HealthMonitor, Probe,
};
use bridge_kernel::{
    ContextFactory, DataTransformer, IntegrationManager, ManagerConfig, ToolCatalog,
};
use bridge_resilience::{CircuitBreakerConfig, RetryError, RetryExecutor, RetryPolicy};
use bridge_telemetry::EventLogger;
use thiserror::Error;
use tracing::info;

/// Errors raised while assembling a [`BridgeRuntime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Health settings were rejected by the monitor.
    #[error(transparent)]
    Health(#[from] HealthError),
    /// Retry settings were rejected by the executor.
    #[error(transparent)]
    Retry(#[from] RetryError),
}

/// Builder for [`BridgeRuntime`].
pub struct BridgeRuntimeBuilder {
    config: BridgeConfig,
    catalog: Option<Arc<dyn ToolCatalog>>,
    transformer: Option<Arc<dyn DataTransformer>>,
}

impl std::fmt::Debug for BridgeRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRuntimeBuilder")
            .field("config", &self.config)
            .field("catalog", &self.catalog.is_some())
            .field("transformer", &self.transformer.is_some())
            .finish()
    }
}

impl BridgeRuntimeBuilder {
    /// Resolves tools by id for [`IntegrationManager::load_from_catalog`].
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn ToolCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Overrides the passthrough data transformer.
    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn DataTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Builds every layer and starts the background loops the configuration
    /// enables. Must be called inside a Tokio runtime.
    ///
    /// `contexts` receives the channel so factories can route tool replies
    /// back into it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the configuration is invalid.
    pub fn build<F>(self, contexts: F) -> Result<BridgeRuntime, RuntimeError>
    where
        F: FnOnce(&Arc<CommunicationChannel>) -> Arc<dyn ContextFactory>,
    {
        let config = self.config;
        config.validate()?;

        let channel = Arc::new(CommunicationChannel::new(channel_config(&config)?));

        let health_config = health_config(&config)?;
        health_config.validate()?;
        let probe: Arc<dyn Probe> = channel.clone();
        let monitor = Arc::new(
            HealthMonitor::new(health_config, probe).with_fallback_graph(fallback_graph(&config)),
        );

        let manager_config = manager_config(&config)?;
        if let Some(policy) = manager_config.retry() {
            policy.validate()?;
        }

        let factory = contexts(&channel);
        let mut builder =
            IntegrationManager::builder(Arc::clone(&channel), Arc::clone(&monitor), factory)
                .config(manager_config)
                .executor(Arc::new(RetryExecutor::new()));
        if let Some(catalog) = self.catalog {
            builder = builder.catalog(catalog);
        }
        if let Some(transformer) = self.transformer {
            builder = builder.transformer(transformer);
        }
        let manager = Arc::new(builder.build());

        let logger = config.telemetry.log_events.then(|| {
            EventLogger::spawn(channel.subscribe(), monitor.subscribe(), manager.subscribe())
        });
        if config.health.start_monitoring {
            monitor.start_monitoring();
        }
        if config.manager.start_recovery {
            manager.start_recovery();
        }

        info!(
            monitoring = monitor.is_monitoring(),
            recovery = config.manager.start_recovery,
            fallbacks = config.fallbacks.len(),
            "toolbridge runtime started"
        );
        Ok(BridgeRuntime {
            manager,
            _logger: logger,
        })
    }
}

/// A fully wired runtime: channel, health monitor, executor, and manager.
#[derive(Debug)]
pub struct BridgeRuntime {
    manager: Arc<IntegrationManager>,
    _logger: Option<EventLogger>,
}

impl BridgeRuntime {
    /// Starts building a runtime from `config`.
    #[must_use]
    pub fn builder(config: BridgeConfig) -> BridgeRuntimeBuilder {
        BridgeRuntimeBuilder {
            config,
            catalog: None,
            transformer: None,
        }
    }

    /// Builds a runtime with the default transformer and no catalog.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the configuration is invalid.
    pub fn from_config<F>(config: BridgeConfig, contexts: F) -> Result<Self, RuntimeError>
    where
        F: FnOnce(&Arc<CommunicationChannel>) -> Arc<dyn ContextFactory>,
    {
        Self::builder(config).build(contexts)
    }

    /// The instance manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<IntegrationManager> {
        &self.manager
    }

    /// The communication channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<CommunicationChannel> {
        self.manager.channel()
    }

    /// The health monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        self.manager.monitor()
    }

    /// Stops background loops and unloads every instance.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

fn channel_config(config: &BridgeConfig) -> Result<ChannelConfig, ConfigError> {
    let settings = &config.channel;
    Ok(ChannelConfig::default()
        .with_ready_timeout(settings.ready_timeout())
        .with_request_options(RequestOptions::new(
            settings.request_timeout(),
            settings.max_retries,
        ))
        .with_ping_options(RequestOptions::new(
            settings.ping_timeout(),
            settings.ping_max_retries,
        ))
        .with_retry_delay(settings.retry_delay())
        .with_cleanup_timeout(settings.cleanup_timeout())
        .with_allowed_origins(settings.allowed_origins.iter().cloned())
        .with_event_capacity(capacity("channel.eventCapacity", settings.event_capacity)?))
}

fn health_config(config: &BridgeConfig) -> Result<HealthConfig, ConfigError> {
    let settings = &config.health;
    Ok(HealthConfig::default()
        .with_check_interval(settings.check_interval())
        .with_thresholds(settings.degraded_threshold(), settings.unhealthy_threshold())
        .with_max_consecutive_failures(count(
            "health.maxConsecutiveFailures",
            settings.max_consecutive_failures,
        )?)
        .with_event_capacity(capacity("health.eventCapacity", settings.event_capacity)?))
}

fn manager_config(config: &BridgeConfig) -> Result<ManagerConfig, ConfigError> {
    let circuit = CircuitBreakerConfig::new(
        count("circuit.failureThreshold", config.circuit.failure_threshold)?,
        config.circuit.reset_timeout(),
    );
    let mut manager = ManagerConfig::default()
        .with_load_timeout(config.manager.load_timeout())
        .with_circuit(circuit)
        .with_event_capacity(capacity("manager.eventCapacity", config.manager.event_capacity)?);

    let retry = &config.retry;
    if retry.enabled {
        let mut policy = RetryPolicy::new(
            count("retry.maxAttempts", retry.max_attempts)?,
            retry.base_delay(),
        )
        .with_backoff_multiplier(retry.backoff_multiplier);
        if let Some(max_delay) = retry.max_delay() {
            policy = policy.with_max_delay(max_delay);
        }
        if let Some(kinds) = &retry.retryable_kinds {
            policy = policy.with_retryable_kinds(kinds.iter().cloned());
        }
        manager = manager.with_retry(policy);
    }
    Ok(manager)
}

fn fallback_graph(config: &BridgeConfig) -> FallbackGraph {
    config
        .fallbacks
        .iter()
        .fold(FallbackGraph::new(), |graph, (tool_id, options)| {
            let options = options
                .iter()
                .map(|option| {
                    FallbackOption::new(option.tool_id.clone(), option.priority)
                        .with_overlap(option.capability_overlap.iter().cloned())
                })
                .collect();
            graph.with(tool_id.clone(), options)
        })
}

fn count(field: &str, value: u32) -> Result<NonZeroU32, ConfigError> {
    NonZeroU32::new(value)
        .ok_or_else(|| ConfigError::Invalid(format!("{field} must be greater than zero")))
}

fn capacity(field: &str, value: usize) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value)
        .ok_or_else(|| ConfigError::Invalid(format!("{field} must be greater than zero")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bridge_config::FallbackSettings;
    use bridge_primitives::ToolId;

    #[test]
    fn translates_every_section() {
        let mut config = BridgeConfig::default();
        config.channel.request_timeout_ms = 2_000;
        config.channel.ping_max_retries = 1;
        config.channel.allowed_origins = vec!["https://tools.example".into()];
        config.health.max_consecutive_failures = 2;
        config.circuit.failure_threshold = 4;
        config.retry.enabled = true;
        config.retry.max_delay_ms = Some(5_000);

        let channel = channel_config(&config).unwrap();
        assert_eq!(channel.request(), RequestOptions::new(Duration::from_secs(2), 3));
        assert_eq!(channel.ping(), RequestOptions::new(Duration::from_secs(5), 1));
        assert_eq!(channel.allowed_origins(), ["https://tools.example"]);

        let health = health_config(&config).unwrap();
        assert_eq!(health.max_consecutive_failures().get(), 2);

        let manager = manager_config(&config).unwrap();
        assert_eq!(manager.circuit().failure_threshold().get(), 4);
        let policy = manager.retry().unwrap();
        assert_eq!(policy.max_attempts().get(), 3);
        assert!(policy.is_retryable("message_timeout"));
        assert!(!policy.is_retryable("remote"));
    }

    #[test]
    fn retry_disabled_by_default() {
        let manager = manager_config(&BridgeConfig::default()).unwrap();
        assert!(manager.retry().is_none());
    }

    #[test]
    fn builds_fallback_graph() {
        let mut config = BridgeConfig::default();
        let primary = ToolId::new("editor").unwrap();
        config.fallbacks.insert(
            primary.clone(),
            vec![FallbackSettings {
                tool_id: ToolId::new("editor-lite").unwrap(),
                priority: 2,
                capability_overlap: vec!["open".into()],
            }],
        );

        let graph = fallback_graph(&config);
        let options = graph.options(&primary);
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].priority, 2);
        assert_eq!(options[0].capability_overlap, ["open"]);
    }
}
