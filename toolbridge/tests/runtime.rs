use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use toolbridge::channel::loopback::{PeerAction, echo_responder};
use toolbridge::channel::{CommunicationChannel, Envelope, Verb};
use toolbridge::config::{BridgeConfig, FallbackSettings};
use toolbridge::health::{HealthEvent, HealthStatus};
use toolbridge::kernel::loopback::{LoopbackFactory, MemoryContainer};
use toolbridge::kernel::{
    ContextFactory, InMemoryCatalog, InstanceStatus, ManagerError, ManagerEvent,
};
use toolbridge::primitives::{Capability, ToolDescriptor, ToolId};
use toolbridge::{BridgeRuntime, RuntimeError};

const ORIGIN: &str = "https://tools.example";

fn descriptor(id: &str) -> ToolDescriptor {
    ToolDescriptor::builder(ToolId::new(id).unwrap())
        .name(id)
        .unwrap()
        .version("1.0.0")
        .unwrap()
        .source(format!("{ORIGIN}/{id}"))
        .capability(Capability::builder("echo").build().unwrap())
        .build()
        .unwrap()
}

fn catalog(ids: &[&str]) -> Arc<InMemoryCatalog> {
    Arc::new(ids.iter().map(|id| descriptor(id)).collect())
}

fn quiet_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.channel.allowed_origins = vec![ORIGIN.into()];
    config.channel.max_retries = 0;
    config.health.start_monitoring = false;
    config.telemetry.log_events = false;
    config
}

/// Builds a runtime over loopback tools and hands back the factory so tests
/// can reach the simulated contexts.
fn runtime_with(
    config: BridgeConfig,
    tools: &[&str],
    factory: impl FnOnce(Arc<CommunicationChannel>) -> LoopbackFactory,
) -> (BridgeRuntime, Arc<LoopbackFactory>) {
    let mut created = None;
    let runtime = BridgeRuntime::builder(config)
        .catalog(catalog(tools))
        .build(|channel| {
            let loopback = Arc::new(factory(Arc::clone(channel)));
            created = Some(Arc::clone(&loopback));
            let contexts: Arc<dyn ContextFactory> = loopback;
            contexts
        })
        .unwrap();
    (runtime, created.unwrap())
}

async fn next_matching<E: Clone, T>(
    rx: &mut broadcast::Receiver<E>,
    mut pick: impl FnMut(E) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event within a minute")
}

#[tokio::test]
async fn catalog_load_execute_transfer_unload() {
    let (runtime, _factory) = runtime_with(quiet_config(), &["viewer", "editor"], |channel| {
        LoopbackFactory::new(channel, ORIGIN)
    });
    let manager = runtime.manager();
    let container = Arc::new(MemoryContainer::new());

    let viewer = manager
        .load_from_catalog(&ToolId::new("viewer").unwrap(), container.clone(), None)
        .await
        .unwrap();
    let editor = manager
        .load_from_catalog(&ToolId::new("editor").unwrap(), container.clone(), None)
        .await
        .unwrap();
    assert_eq!(viewer.status, InstanceStatus::Ready);
    assert_eq!(manager.get_all_instances().len(), 2);

    let params = json!({"page": 3, "zoom": 1.5});
    let echoed = manager
        .execute_capability(viewer.instance_id, "echo", params.clone())
        .await
        .unwrap();
    assert_eq!(echoed, params);

    let ack = manager
        .transfer_data(viewer.instance_id, editor.instance_id, json!({"doc": "a.pdf"}))
        .await
        .unwrap();
    assert_eq!(ack, json!({"received": true}));

    let err = manager
        .load_from_catalog(&ToolId::new("missing").unwrap(), container.clone(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::UnknownTool { .. }));

    runtime.shutdown().await;
    assert!(manager.get_all_instances().is_empty());
    assert!(container.attached().is_empty());
    assert_eq!(runtime.channel().total_pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_instance_triggers_fallback_and_recovery() {
    let mut config = quiet_config();
    config.health.start_monitoring = true;
    config.health.check_interval_ms = 1_000;
    config.health.max_consecutive_failures = 3;
    config.fallbacks.insert(
        ToolId::new("editor").unwrap(),
        vec![FallbackSettings {
            tool_id: ToolId::new("editor-lite").unwrap(),
            priority: 1,
            capability_overlap: vec!["echo".into()],
        }],
    );
    let (runtime, factory) = runtime_with(config, &["editor", "editor-lite"], |channel| {
        LoopbackFactory::new(channel, ORIGIN)
    });
    let manager = runtime.manager();
    let mut health = runtime.monitor().subscribe();
    let mut lifecycle = manager.subscribe();
    let container = Arc::new(MemoryContainer::new());

    let editor = manager
        .load_from_catalog(&ToolId::new("editor").unwrap(), container.clone(), None)
        .await
        .unwrap();
    manager
        .load_from_catalog(&ToolId::new("editor-lite").unwrap(), container.clone(), None)
        .await
        .unwrap();

    factory.context(editor.instance_id).unwrap().close();

    let failures = next_matching(&mut health, |event| match event {
        HealthEvent::HealthCheckFailed {
            instance_id,
            consecutive_failures,
            ..
        } if instance_id == editor.instance_id => Some(consecutive_failures),
        _ => None,
    })
    .await;
    assert_eq!(failures, 3);

    let fallback = next_matching(&mut health, |event| match event {
        HealthEvent::FallbackTriggered {
            failed_instance_id,
            fallback_tool_id,
            ..
        } if failed_instance_id == editor.instance_id => Some(fallback_tool_id),
        _ => None,
    })
    .await;
    assert_eq!(fallback.as_str(), "editor-lite");

    next_matching(&mut lifecycle, |event| match event {
        ManagerEvent::InstanceError { instance_id, .. } if instance_id == editor.instance_id => {
            Some(())
        }
        _ => None,
    })
    .await;
    assert_eq!(
        manager.get_instance_status(editor.instance_id),
        Some(InstanceStatus::Error)
    );

    let record = runtime.monitor().health_record(editor.instance_id).unwrap();
    assert_eq!(record.status, HealthStatus::Unhealthy);
    let options = manager.fallback_options(&ToolId::new("editor").unwrap());
    assert_eq!(options[0].health, HealthStatus::Healthy);

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn configured_retry_policy_absorbs_transient_failures() {
    let mut config = quiet_config();
    config.retry.enabled = true;
    config.retry.base_delay_ms = 50;
    config.retry.retryable_kinds = Some(vec!["remote".into()]);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let (runtime, factory) = runtime_with(config, &["flaky"], move |channel| {
        LoopbackFactory::new(channel, ORIGIN).with_responder(move |envelope: &Envelope| {
            if *envelope.verb() == Verb::ExecuteCapability
                && seen.fetch_add(1, Ordering::SeqCst) < 2
            {
                return PeerAction::Fail("warming up".into());
            }
            echo_responder(envelope)
        })
    });
    let manager = runtime.manager();

    let instance = manager
        .load_from_catalog(
            &ToolId::new("flaky").unwrap(),
            Arc::new(MemoryContainer::new()),
            None,
        )
        .await
        .unwrap();
    let result = manager
        .execute_capability(instance.instance_id, "echo", json!({"n": 1}))
        .await
        .unwrap();

    assert_eq!(result, json!({"n": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let executes = factory
        .context(instance.instance_id)
        .unwrap()
        .posted_verbs()
        .into_iter()
        .filter(|verb| *verb == Verb::ExecuteCapability)
        .count();
    assert_eq!(executes, 3);

    runtime.shutdown().await;
}

#[test]
fn rejects_invalid_configuration() {
    let mut config = BridgeConfig::default();
    config.health.degraded_threshold_ms = 10_000;
    config.health.unhealthy_threshold_ms = 10;

    let err = BridgeRuntime::from_config(config, |_| unreachable!("not assembled"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Config(_)));
}
