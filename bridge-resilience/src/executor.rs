//! Retry and circuit-breaker execution.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::circuit::{Admission, Circuit};
use crate::{
    CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState, Classify, RetryOutcome,
    RetryPolicy,
};

/// Decorates fallible asynchronous operations with retry and circuit breaking.
///
/// Circuit state is owned by the executor and keyed by caller-supplied
/// strings; share one executor (behind an `Arc`) to share circuits.
#[derive(Debug, Default)]
pub struct RetryExecutor {
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl RetryExecutor {
    /// Creates an executor with no circuits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` up to `policy.max_attempts()` times.
    ///
    /// Between attempts the executor sleeps for
    /// [`RetryPolicy::delay_for`]. An error whose kind the policy does not list
    /// as retryable ends the loop immediately. This never returns early with an
    /// error: inspect the returned [`RetryOutcome`].
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        mut op: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = policy.max_attempts().get();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return RetryOutcome::new(Ok(value), attempt),
                Err(err) => err,
            };

            if !policy.is_retryable(err.kind()) {
                debug!(attempt, kind = err.kind(), "error is not retryable");
                return RetryOutcome::new(Err(err), attempt);
            }
            if attempt >= max_attempts {
                warn!(attempt, kind = err.kind(), error = %err, "retry attempts exhausted");
                return RetryOutcome::new(Err(err), attempt);
            }

            let delay = policy.delay_for(attempt);
            warn!(
                attempt,
                max_attempts,
                kind = err.kind(),
                error = %err,
                ?delay,
                "operation failed; retrying"
            );
            sleep(delay).await;
        }
    }

    /// Runs `op` behind the circuit identified by `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Open`] without invoking `op` while the circuit
    /// is open (or while a half-open probe is already in flight), and
    /// [`CircuitError::Inner`] when `op` itself fails.
    pub async fn execute_with_circuit_breaker<F, Fut, T, E>(
        &self,
        config: CircuitBreakerConfig,
        key: &str,
        op: F,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.with_circuit(key, |circuit| {
            circuit.admit(key, config, Instant::now())
        });
        if admission == Admission::Reject {
            debug!(key, "circuit open; call rejected");
            return Err(CircuitError::Open {
                key: key.to_owned(),
            });
        }

        let mut guard = ProbeGuard {
            executor: self,
            key,
            armed: admission == Admission::Probe,
        };
        let result = op().await;
        guard.armed = false;

        self.with_circuit(key, |circuit| match &result {
            Ok(_) => circuit.on_success(key),
            Err(_) => circuit.on_failure(key, config, Instant::now()),
        });

        result.map_err(CircuitError::Inner)
    }

    /// Returns the state of the circuit for `key`; unknown keys are closed.
    #[must_use]
    pub fn circuit_state(&self, key: &str) -> CircuitSnapshot {
        let circuits = self.circuits.lock().expect("circuit table poisoned");
        circuits.get(key).map_or(
            CircuitSnapshot {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            },
            Circuit::snapshot,
        )
    }

    /// Forgets the circuit for `key`, closing it.
    pub fn reset_circuit(&self, key: &str) {
        let mut circuits = self.circuits.lock().expect("circuit table poisoned");
        if circuits.remove(key).is_some() {
            debug!(key, "circuit reset");
        }
    }

    fn with_circuit<R>(&self, key: &str, f: impl FnOnce(&mut Circuit) -> R) -> R {
        let mut circuits = self.circuits.lock().expect("circuit table poisoned");
        let circuit = circuits.entry(key.to_owned()).or_insert_with(Circuit::new);
        f(circuit)
    }
}

/// Releases a half-open probe slot when the guarded future is dropped before
/// completing.
struct ProbeGuard<'a> {
    executor: &'a RetryExecutor,
    key: &'a str,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.executor.with_circuit(self.key, Circuit::abandon_probe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Classify for TestError {
        fn kind(&self) -> &str {
            self.0
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            NonZeroU32::new(max_attempts).unwrap(),
            Duration::from_millis(100),
        )
    }

    fn breaker() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(NonZeroU32::new(3).unwrap(), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_op_runs_max_attempts() {
        let executor = RetryExecutor::new();
        for n in 1..=5 {
            let calls = Arc::new(AtomicUsize::new(0));
            let outcome = executor
                .execute_with_retry(&policy(n), || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TestError("transient"))
                    }
                })
                .await;

            assert!(!outcome.is_success());
            assert_eq!(outcome.attempts(), n);
            assert_eq!(calls.load(Ordering::SeqCst), n as usize);
            assert_eq!(outcome.last_error().map(|e| e.0), Some("transient"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_after_one_attempt() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = policy(5).with_retryable_kinds(["message_timeout"]);

        let outcome = executor
            .execute_with_retry(&policy, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("capability_not_found"))
                }
            })
            .await;

        assert_eq!(outcome.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_exponential_backoff_between_attempts() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let outcome = executor
            .execute_with_retry(&policy(3), || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError("transient"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.value(), Some(&"done"));
        assert_eq!(outcome.attempts(), 3);
        assert!(outcome.last_error().is_none());
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_invoking() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let result = executor
                .execute_with_circuit_breaker(breaker(), "tool", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("boom"))
                })
                .await;
            assert!(matches!(result, Err(CircuitError::Inner(_))));
        }
        assert_eq!(executor.circuit_state("tool").state, CircuitState::Open);

        let inner_calls = Arc::clone(&calls);
        let result = executor
            .execute_with_circuit_breaker(breaker(), "tool", || async move {
                inner_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_after_reset_timeout_closes_circuit() {
        let executor = Arc::new(RetryExecutor::new());
        for _ in 0..3 {
            let _ = executor
                .execute_with_circuit_breaker(breaker(), "tool", || async {
                    Err::<(), _>(TestError("boom"))
                })
                .await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;

        // The probe is held open while a second caller arrives.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_executor = Arc::clone(&executor);
        let probe = tokio::spawn(async move {
            probe_executor
                .execute_with_circuit_breaker(breaker(), "tool", || async move {
                    let _ = release_rx.await;
                    Ok::<_, TestError>("probe")
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(executor.circuit_state("tool").state, CircuitState::HalfOpen);

        let concurrent = executor
            .execute_with_circuit_breaker(breaker(), "tool", || async {
                Ok::<_, TestError>("second")
            })
            .await;
        assert!(matches!(concurrent, Err(CircuitError::Open { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), "probe");
        assert_eq!(executor.circuit_state("tool").state, CircuitState::Closed);
        assert_eq!(executor.circuit_state("tool").failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_restarts_timer() {
        let executor = RetryExecutor::new();
        for _ in 0..3 {
            let _ = executor
                .execute_with_circuit_breaker(breaker(), "tool", || async {
                    Err::<(), _>(TestError("boom"))
                })
                .await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let probe = executor
            .execute_with_circuit_breaker(breaker(), "tool", || async {
                Err::<(), _>(TestError("still down"))
            })
            .await;
        assert!(matches!(probe, Err(CircuitError::Inner(_))));

        let snapshot = executor.circuit_state("tool");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.opened_at, Some(Instant::now()));

        tokio::time::advance(Duration::from_secs(10)).await;
        let rejected = executor
            .execute_with_circuit_breaker(breaker(), "tool", || async {
                Ok::<_, TestError>(())
            })
            .await;
        assert!(matches!(rejected, Err(CircuitError::Open { .. })));
    }

    #[tokio::test]
    async fn reset_closes_circuit() {
        let executor = RetryExecutor::new();
        for _ in 0..3 {
            let _ = executor
                .execute_with_circuit_breaker(breaker(), "tool", || async {
                    Err::<(), _>(TestError("boom"))
                })
                .await;
        }
        executor.reset_circuit("tool");
        assert_eq!(executor.circuit_state("tool").state, CircuitState::Closed);
    }
}
