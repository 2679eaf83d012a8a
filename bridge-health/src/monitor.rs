//! Periodic probing and fallback resolution.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bridge_primitives::{InstanceId, ToolId};
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    FallbackCandidate, FallbackGraph, FallbackOption, HealthConfig, HealthError, HealthEvent,
    HealthRecord, HealthResult, HealthStatus, Probe,
};

/// Tracks the health of every registered instance.
pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn Probe>,
    records: RwLock<HashMap<InstanceId, HealthRecord>>,
    fallbacks: RwLock<FallbackGraph>,
    events: broadcast::Sender<HealthEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("probe", &"dyn Probe")
            .field("instances", &self.records.read().map(|r| r.len()).unwrap_or_default())
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

impl HealthMonitor {
    /// Creates a monitor that probes through `probe`.
    #[must_use]
    pub fn new(config: HealthConfig, probe: Arc<dyn Probe>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity().get());
        Self {
            config,
            probe,
            records: RwLock::new(HashMap::new()),
            fallbacks: RwLock::new(FallbackGraph::new()),
            events,
            worker: Mutex::new(None),
        }
    }

    /// Seeds the fallback graph.
    #[must_use]
    pub fn with_fallback_graph(self, graph: FallbackGraph) -> Self {
        *self.fallbacks.write().expect("fallback graph poisoned") = graph;
        self
    }

    /// Returns the monitor configuration.
    #[must_use]
    pub const fn config(&self) -> HealthConfig {
        self.config
    }

    /// Starts tracking an instance with a fresh healthy record.
    pub fn add_instance(&self, instance_id: InstanceId, tool_id: ToolId) {
        debug!(%instance_id, %tool_id, "instance registered for health checks");
        self.records
            .write()
            .expect("health records poisoned")
            .insert(instance_id, HealthRecord::new(tool_id));
    }

    /// Stops tracking an instance, returning its last record.
    pub fn remove_instance(&self, instance_id: InstanceId) -> Option<HealthRecord> {
        let removed = self
            .records
            .write()
            .expect("health records poisoned")
            .remove(&instance_id);
        if removed.is_some() {
            debug!(%instance_id, "instance removed from health checks");
        }
        removed
    }

    /// Pings one instance and updates its record.
    ///
    /// Once the instance reaches the consecutive failure limit a
    /// [`HealthEvent::HealthCheckFailed`] is published, followed by either
    /// [`HealthEvent::FallbackTriggered`] or [`HealthEvent::NoFallbackAvailable`].
    ///
    /// # Errors
    ///
    /// Returns [`HealthError::UnknownInstance`] when the instance is not
    /// tracked, including when it is removed while the ping is in flight.
    pub async fn perform_health_check(&self, instance_id: InstanceId) -> HealthResult<HealthRecord> {
        if !self.is_tracked(instance_id) {
            return Err(HealthError::UnknownInstance { instance_id });
        }

        let outcome = self.probe.ping(instance_id).await;

        let record = {
            let mut records = self.records.write().expect("health records poisoned");
            let record = records
                .get_mut(&instance_id)
                .ok_or(HealthError::UnknownInstance { instance_id })?;
            match &outcome {
                Ok(latency) => record.record_success(self.config.classify(*latency), *latency),
                Err(err) => record.record_failure(err.to_string()),
            }
            record.clone()
        };

        match &outcome {
            Ok(latency) => {
                debug!(%instance_id, status = ?record.status, ?latency, "health check completed");
            }
            Err(err) => {
                warn!(
                    %instance_id,
                    error = %err,
                    consecutive_failures = record.consecutive_failures,
                    "health check failed"
                );
                if record.consecutive_failures >= self.config.max_consecutive_failures().get() {
                    self.publish(HealthEvent::HealthCheckFailed {
                        instance_id,
                        tool_id: record.tool_id.clone(),
                        consecutive_failures: record.consecutive_failures,
                        error: err.to_string(),
                    });
                    self.resolve_fallback(instance_id, &record.tool_id);
                }
            }
        }

        Ok(record)
    }

    /// Checks every tracked instance concurrently.
    ///
    /// Each instance's result is reported individually; one failure does not
    /// affect the others.
    pub async fn perform_batch_health_check(
        &self,
    ) -> Vec<(InstanceId, HealthResult<HealthRecord>)> {
        self.check_instances(self.tracked_instances()).await
    }

    /// Fallback candidates for `tool_id`, healthy first, then by priority.
    #[must_use]
    pub fn get_fallback_options(&self, tool_id: &ToolId) -> Vec<FallbackCandidate> {
        let options = self
            .fallbacks
            .read()
            .expect("fallback graph poisoned")
            .options(tool_id)
            .to_vec();

        let mut candidates: Vec<FallbackCandidate> = options
            .into_iter()
            .map(|option| FallbackCandidate {
                health: self.tool_health(&option.tool_id),
                option,
            })
            .collect();
        candidates.sort_by_key(|c| (c.health != HealthStatus::Healthy, c.option.priority));
        candidates
    }

    /// Replaces the fallback options for `tool_id`.
    pub fn set_fallback_options(&self, tool_id: ToolId, options: Vec<FallbackOption>) {
        self.fallbacks
            .write()
            .expect("fallback graph poisoned")
            .set(tool_id, options);
    }

    /// Aggregate health of a tool across its tracked instances.
    ///
    /// A tool without instances counts as healthy; a mix of states counts as
    /// degraded.
    #[must_use]
    pub fn tool_health(&self, tool_id: &ToolId) -> HealthStatus {
        let records = self.records.read().expect("health records poisoned");
        let mut statuses = records
            .values()
            .filter(|record| &record.tool_id == tool_id)
            .map(|record| record.status)
            .peekable();

        let Some(first) = statuses.peek().copied() else {
            return HealthStatus::Healthy;
        };
        let uniform = statuses.all(|status| status == first);
        match first {
            HealthStatus::Healthy | HealthStatus::Unhealthy if uniform => first,
            _ => HealthStatus::Degraded,
        }
    }

    /// Snapshot of every record.
    #[must_use]
    pub fn get_all_health_statuses(&self) -> HashMap<InstanceId, HealthRecord> {
        self.records.read().expect("health records poisoned").clone()
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn health_record(&self, instance_id: InstanceId) -> Option<HealthRecord> {
        self.records
            .read()
            .expect("health records poisoned")
            .get(&instance_id)
            .cloned()
    }

    /// Tracked instances running `tool_id`.
    #[must_use]
    pub fn instances_of(&self, tool_id: &ToolId) -> Vec<InstanceId> {
        self.records
            .read()
            .expect("health records poisoned")
            .iter()
            .filter(|(_, record)| &record.tool_id == tool_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Subscribes to health events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Starts the background check loop. Returns `false` if it was already
    /// running.
    ///
    /// The loop holds the monitor weakly and ends once the monitor is
    /// dropped. An instance at or past the failure limit sits out rounds
    /// after each failed check: one, then twice as many per further failure,
    /// up to eight. A successful check returns it to every round.
    pub fn start_monitoring(self: &Arc<Self>) -> bool {
        let mut worker = self.worker.lock().expect("monitor worker poisoned");
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let monitor = Arc::downgrade(self);
        let interval = self.config.check_interval();
        *worker = Some(tokio::spawn(run_check_loop(monitor, interval)));
        info!(?interval, "health monitoring started");
        true
    }

    /// Stops the background check loop. Returns `false` if it was not
    /// running.
    pub fn stop_monitoring(&self) -> bool {
        let handle = self.worker.lock().expect("monitor worker poisoned").take();
        match handle {
            Some(handle) => {
                handle.abort();
                info!("health monitoring stopped");
                true
            }
            None => false,
        }
    }

    /// Returns `true` while the background loop runs.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    fn tracked_instances(&self) -> Vec<InstanceId> {
        self.records
            .read()
            .expect("health records poisoned")
            .keys()
            .copied()
            .collect()
    }

    async fn check_instances(
        &self,
        instance_ids: Vec<InstanceId>,
    ) -> Vec<(InstanceId, HealthResult<HealthRecord>)> {
        join_all(instance_ids.into_iter().map(|instance_id| async move {
            (instance_id, self.perform_health_check(instance_id).await)
        }))
        .await
    }

    fn is_tracked(&self, instance_id: InstanceId) -> bool {
        self.records
            .read()
            .expect("health records poisoned")
            .contains_key(&instance_id)
    }

    fn resolve_fallback(&self, instance_id: InstanceId, tool_id: &ToolId) {
        let candidates = self.get_fallback_options(tool_id);
        match candidates.first() {
            Some(best) if best.health == HealthStatus::Healthy => {
                info!(
                    %instance_id,
                    %tool_id,
                    fallback = %best.option.tool_id,
                    "fallback selected"
                );
                self.publish(HealthEvent::FallbackTriggered {
                    failed_instance_id: instance_id,
                    failed_tool_id: tool_id.clone(),
                    fallback_tool_id: best.option.tool_id.clone(),
                });
            }
            _ => {
                warn!(
                    %instance_id,
                    %tool_id,
                    candidates = candidates.len(),
                    "no healthy fallback available"
                );
                self.publish(HealthEvent::NoFallbackAvailable {
                    instance_id,
                    tool_id: tool_id.clone(),
                });
            }
        }
    }

    fn publish(&self, event: HealthEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Ok(worker) = self.worker.get_mut() {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        }
    }
}

const MAX_BACKOFF_ROUNDS: u32 = 8;

/// Rounds each failed-out instance still has to sit out.
#[derive(Debug, Default)]
struct Backoff {
    cooling: HashMap<InstanceId, Cooldown>,
}

#[derive(Debug, Clone, Copy)]
struct Cooldown {
    span: u32,
    remaining: u32,
}

impl Backoff {
    /// Instances to check this round. Forgets instances no longer tracked.
    fn due(&mut self, tracked: Vec<InstanceId>) -> Vec<InstanceId> {
        let known: HashSet<InstanceId> = tracked.iter().copied().collect();
        self.cooling.retain(|instance_id, _| known.contains(instance_id));

        tracked
            .into_iter()
            .filter(|instance_id| match self.cooling.get_mut(instance_id) {
                Some(cooldown) if cooldown.remaining > 0 => {
                    cooldown.remaining -= 1;
                    false
                }
                _ => true,
            })
            .collect()
    }

    fn record(&mut self, instance_id: InstanceId, failed_out: bool) {
        if !failed_out {
            self.cooling.remove(&instance_id);
            return;
        }
        let span = self
            .cooling
            .get(&instance_id)
            .map_or(1, |cooldown| (cooldown.span * 2).min(MAX_BACKOFF_ROUNDS));
        self.cooling.insert(
            instance_id,
            Cooldown {
                span,
                remaining: span,
            },
        );
    }
}

async fn run_check_loop(monitor: Weak<HealthMonitor>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backoff = Backoff::default();

    loop {
        interval.tick().await;
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        let limit = monitor.config().max_consecutive_failures().get();
        let tracked = monitor.tracked_instances();
        let total = tracked.len();
        let due = backoff.due(tracked);
        let skipped = total - due.len();

        let results = monitor.check_instances(due).await;
        let mut failing = 0;
        for (instance_id, result) in &results {
            // Removed mid-round; pruned on the next one.
            let Ok(record) = result else { continue };
            if record.status != HealthStatus::Healthy {
                failing += 1;
            }
            backoff.record(*instance_id, record.consecutive_failures >= limit);
        }
        debug!(checked = results.len(), skipped, failing, "health check round finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bridge_channel::{ChannelError, ChannelResult};
    use bridge_primitives::MessageId;

    /// Probe answering from a per-instance script; unscripted pings take 10ms.
    #[derive(Default)]
    struct ScriptedProbe {
        scripts: Mutex<HashMap<InstanceId, VecDeque<ChannelResult<Duration>>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedProbe {
        fn script(&self, instance_id: InstanceId, results: Vec<ChannelResult<Duration>>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(instance_id, results.into());
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn ping(&self, instance_id: InstanceId) -> ChannelResult<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.scripts
                .lock()
                .unwrap()
                .get_mut(&instance_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(Duration::from_millis(10)))
        }
    }

    fn timeout(instance_id: InstanceId) -> ChannelResult<Duration> {
        Err(ChannelError::MessageTimeout {
            instance_id,
            message_id: MessageId::random(),
            verb: "ping".into(),
            attempts: 1,
        })
    }

    fn tool(id: &str) -> ToolId {
        ToolId::new(id).unwrap()
    }

    fn monitor(probe: Arc<ScriptedProbe>) -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default(), probe)
    }

    #[tokio::test]
    async fn classifies_latency() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(Arc::clone(&probe));
        let id = InstanceId::random();
        monitor.add_instance(id, tool("editor"));
        probe.script(
            id,
            vec![
                Ok(Duration::from_millis(1000)),
                Ok(Duration::from_millis(1200)),
                Ok(Duration::from_millis(6000)),
            ],
        );

        let statuses = [
            monitor.perform_health_check(id).await.unwrap().status,
            monitor.perform_health_check(id).await.unwrap().status,
            monitor.perform_health_check(id).await.unwrap().status,
        ];
        assert_eq!(
            statuses,
            [HealthStatus::Healthy, HealthStatus::Degraded, HealthStatus::Unhealthy]
        );
        let record = monitor.health_record(id).unwrap();
        assert_eq!(record.error_count, 0);
        assert_eq!(record.last_latency, Some(Duration::from_millis(6000)));
    }

    #[tokio::test]
    async fn repeated_failures_raise_exactly_one_decision() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(Arc::clone(&probe));
        let id = InstanceId::random();
        monitor.add_instance(id, tool("editor"));
        probe.script(id, vec![timeout(id), timeout(id), timeout(id)]);
        let mut events = monitor.subscribe();

        for _ in 0..2 {
            monitor.perform_health_check(id).await.unwrap();
        }
        assert!(events.try_recv().is_err());

        let record = monitor.perform_health_check(id).await.unwrap();
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert_eq!(record.consecutive_failures, 3);
        assert_eq!(record.error_count, 3);
        assert!(record.last_error.is_some());

        assert!(matches!(
            events.try_recv().unwrap(),
            HealthEvent::HealthCheckFailed { consecutive_failures: 3, .. }
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            HealthEvent::NoFallbackAvailable {
                instance_id: id,
                tool_id: tool("editor")
            }
        );
        assert!(events.try_recv().is_err());

        let record = monitor.perform_health_check(id).await.unwrap();
        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.error_count, 3);
    }

    #[tokio::test]
    async fn healthy_fallback_is_triggered() {
        let probe = Arc::new(ScriptedProbe::default());
        let config = HealthConfig::default()
            .with_max_consecutive_failures(NonZeroU32::new(1).unwrap());
        let monitor = HealthMonitor::new(config, probe.clone() as Arc<dyn Probe>)
            .with_fallback_graph(
                FallbackGraph::new().with(tool("editor"), vec![FallbackOption::new(tool("lite"), 1)]),
            );
        let id = InstanceId::random();
        monitor.add_instance(id, tool("editor"));
        probe.script(id, vec![timeout(id)]);
        let mut events = monitor.subscribe();

        monitor.perform_health_check(id).await.unwrap();

        assert!(matches!(events.try_recv().unwrap(), HealthEvent::HealthCheckFailed { .. }));
        assert_eq!(
            events.try_recv().unwrap(),
            HealthEvent::FallbackTriggered {
                failed_instance_id: id,
                failed_tool_id: tool("editor"),
                fallback_tool_id: tool("lite"),
            }
        );
    }

    #[tokio::test]
    async fn fallback_options_prefer_healthy_then_priority() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(Arc::clone(&probe));
        monitor.set_fallback_options(
            tool("editor"),
            vec![
                FallbackOption::new(tool("a"), 2),
                FallbackOption::new(tool("b"), 1),
            ],
        );
        let b = InstanceId::random();
        monitor.add_instance(b, tool("b"));
        probe.script(b, vec![timeout(b)]);
        monitor.perform_health_check(b).await.unwrap();

        let candidates = monitor.get_fallback_options(&tool("editor"));
        let order: Vec<(&str, HealthStatus)> = candidates
            .iter()
            .map(|c| (c.option.tool_id.as_str(), c.health))
            .collect();
        assert_eq!(
            order,
            vec![("a", HealthStatus::Healthy), ("b", HealthStatus::Unhealthy)]
        );
        assert!(monitor.get_fallback_options(&tool("unseeded")).is_empty());
    }

    #[tokio::test]
    async fn mixed_instances_make_a_tool_degraded() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(Arc::clone(&probe));
        let good = InstanceId::random();
        let bad = InstanceId::random();
        monitor.add_instance(good, tool("lite"));
        monitor.add_instance(bad, tool("lite"));
        probe.script(bad, vec![timeout(bad)]);

        monitor.perform_batch_health_check().await;

        assert_eq!(monitor.tool_health(&tool("lite")), HealthStatus::Degraded);
        assert_eq!(monitor.tool_health(&tool("absent")), HealthStatus::Healthy);
        let mut instances = monitor.instances_of(&tool("lite"));
        instances.sort();
        let mut expected = vec![good, bad];
        expected.sort();
        assert_eq!(instances, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_checks_run_concurrently() {
        let probe = Arc::new(ScriptedProbe {
            delay: Some(Duration::from_secs(1)),
            ..ScriptedProbe::default()
        });
        let monitor = monitor(Arc::clone(&probe));
        let ids: Vec<InstanceId> = (0..3).map(|_| InstanceId::random()).collect();
        for id in &ids {
            monitor.add_instance(*id, tool("editor"));
        }
        probe.script(ids[1], vec![timeout(ids[1])]);
        let started = tokio::time::Instant::now();

        let results = monitor.perform_batch_health_check().await;

        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(
            monitor.health_record(ids[1]).unwrap().status,
            HealthStatus::Unhealthy
        );
        assert_eq!(monitor.get_all_health_statuses().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_loop_runs_until_stopped() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = Arc::new(monitor(Arc::clone(&probe)));
        monitor.add_instance(InstanceId::random(), tool("editor"));

        assert!(monitor.start_monitoring());
        assert!(!monitor.start_monitoring());
        assert!(monitor.is_monitoring());

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);

        assert!(monitor.stop_monitoring());
        assert!(!monitor.stop_monitoring());
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_loop_backs_off_failed_instances() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig::default().with_max_consecutive_failures(NonZeroU32::new(1).unwrap()),
            Arc::clone(&probe) as Arc<dyn Probe>,
        ));
        let id = InstanceId::random();
        monitor.add_instance(id, tool("editor"));
        probe.script(id, (0..4).map(|_| timeout(id)).collect());
        let mut events = monitor.subscribe();
        monitor.start_monitoring();

        // Failed checks at 0s, 120s, 300s and 600s.
        tokio::time::sleep(Duration::from_secs(605)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        assert_eq!(monitor.health_record(id).unwrap().consecutive_failures, 4);

        // Eight rounds out, then a success at 1140s restores every round.
        tokio::time::sleep(Duration::from_secs(660)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 7);
        assert_eq!(monitor.health_record(id).unwrap().status, HealthStatus::Healthy);

        let mut decisions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let HealthEvent::HealthCheckFailed {
                consecutive_failures,
                ..
            } = event
            {
                decisions.push(consecutive_failures);
            }
        }
        assert_eq!(decisions, [1, 2, 3, 4]);
        monitor.stop_monitoring();
    }

    #[tokio::test]
    async fn unknown_and_removed_instances() {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = monitor(Arc::clone(&probe));
        let id = InstanceId::random();

        assert_eq!(
            monitor.perform_health_check(id).await.unwrap_err(),
            HealthError::UnknownInstance { instance_id: id }
        );

        monitor.add_instance(id, tool("editor"));
        let removed = monitor.remove_instance(id).unwrap();
        assert_eq!(removed.tool_id, tool("editor"));
        assert!(monitor.health_record(id).is_none());
        assert!(monitor.remove_instance(id).is_none());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }
}
