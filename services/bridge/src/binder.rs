//! Binding actuator.
//!
//! Turns assignment decisions into binding calls on a dedicated pool. Each
//! decision gets up to `retry.max_attempts` calls, each bounded by
//! `call_timeout`; the outcome records attempts, success, and latency across
//! all attempts.
//!
//! A binding call can fail after the bind landed (the response was lost). The
//! retry then sees a conflict. With `verify_before_retry` the actuator reads
//! the live object first and treats "already on the target node with the
//! same uid" as success.

use std::sync::Arc;
use std::time::Duration;

use kbind_events::{AssignmentDecision, BindingOutcome};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ApiError, BindingRequest, ClusterClient};
use crate::pool::{PoolError, ShutdownReport, WorkerPool};
use crate::retry::RetryPolicy;

/// Actuator settings.
#[derive(Debug, Clone)]
pub struct BinderConfig {
    pub retry: RetryPolicy,

    /// Deadline for a single binding call.
    pub call_timeout: Duration,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A submitted binding. Await [`PendingBinding::outcome`] for the result, or
/// drop it to fire and forget.
#[derive(Debug)]
pub struct PendingBinding {
    decision: AssignmentDecision,
    rx: oneshot::Receiver<BindingOutcome>,
}

impl PendingBinding {
    pub fn decision(&self) -> &AssignmentDecision {
        &self.decision
    }

    /// Wait for the outcome. `None` if the job was aborted before finishing.
    pub async fn outcome(self) -> Option<BindingOutcome> {
        self.rx.await.ok()
    }
}

/// Issues binding calls for assignment decisions.
pub struct Binder<C: ClusterClient> {
    client: Arc<C>,
    pool: WorkerPool,
    config: BinderConfig,
}

impl<C: ClusterClient> Binder<C> {
    pub fn new(client: Arc<C>, pool: WorkerPool, config: BinderConfig) -> Self {
        Self {
            client,
            pool,
            config,
        }
    }

    pub fn config(&self) -> &BinderConfig {
        &self.config
    }

    /// Binding jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Bind one decision on the caller's task.
    pub async fn bind(&self, decision: &AssignmentDecision) -> BindingOutcome {
        let outcome = actuate(self.client.as_ref(), &self.config, decision).await;
        log_outcome(&outcome);
        outcome
    }

    /// Queue one binding job per decision. Returns immediately.
    pub fn bind_many(
        &self,
        decisions: Vec<AssignmentDecision>,
    ) -> Result<Vec<PendingBinding>, BindError> {
        let mut pending = Vec::with_capacity(decisions.len());

        for decision in decisions {
            let (tx, rx) = oneshot::channel();
            let client = self.client.clone();
            let config = self.config.clone();
            let job_decision = decision.clone();

            self.pool.submit(&decision.identity(), async move {
                let outcome = actuate(client.as_ref(), &config, &job_decision).await;
                log_outcome(&outcome);
                let _ = tx.send(outcome);
            })?;

            pending.push(PendingBinding { decision, rx });
        }

        Ok(pending)
    }

    /// Stop accepting decisions and drain the binding pool.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.pool.shutdown(timeout).await
    }
}

enum Verified {
    AlreadyBound,
    Retry,
    GiveUp(String),
}

async fn verify<C: ClusterClient + ?Sized>(
    client: &C,
    config: &BinderConfig,
    decision: &AssignmentDecision,
) -> Verified {
    let lookup = tokio::time::timeout(
        config.call_timeout,
        client.current_binding(&decision.namespace, &decision.workload_unit_name),
    )
    .await
    .unwrap_or(Err(ApiError::Timeout(config.call_timeout)));

    match lookup {
        Ok(None) => Verified::GiveUp("workload unit no longer exists".to_string()),
        Ok(Some(current)) if current.uid != decision.workload_unit_uid => Verified::GiveUp(format!(
            "workload unit was replaced (uid {})",
            current.uid
        )),
        Ok(Some(current)) => match current.node_name {
            Some(node) if node == decision.node_name => Verified::AlreadyBound,
            Some(node) => Verified::GiveUp(format!("workload unit is bound to {node}")),
            None => Verified::Retry,
        },
        Err(e) => {
            debug!(identity = %decision.identity(), error = %e, "Verification read failed; retrying");
            Verified::Retry
        }
    }
}

/// Run the binding calls for one decision.
async fn actuate<C: ClusterClient + ?Sized>(
    client: &C,
    config: &BinderConfig,
    decision: &AssignmentDecision,
) -> BindingOutcome {
    let request = BindingRequest::from(decision);
    let policy = &config.retry;
    let max_attempts = policy.attempts();
    let started = Instant::now();

    let mut attempts = 0;

    let result: Result<(), String> = loop {
        attempts += 1;
        let call = tokio::time::timeout(config.call_timeout, client.create_binding(&request))
            .await
            .unwrap_or(Err(ApiError::Timeout(config.call_timeout)));

        let error = match call {
            Ok(()) => break Ok(()),
            Err(e) => {
                debug!(identity = %decision.identity(), attempt = attempts, error = %e, "Binding call failed");
                e.to_string()
            }
        };

        if attempts >= max_attempts {
            break Err(error);
        }

        if policy.verify_before_retry {
            match verify(client, config, decision).await {
                Verified::AlreadyBound => break Ok(()),
                Verified::GiveUp(reason) => {
                    debug!(identity = %decision.identity(), reason = %reason, "Not retrying binding");
                    break Err(error);
                }
                Verified::Retry => {}
            }
        }

        let delay = policy.backoff.delay(attempts - 1);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    };

    BindingOutcome {
        decision: decision.clone(),
        attempts,
        success: result.is_ok(),
        latency_nanos: u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX),
        last_error: result.err(),
    }
}

fn log_outcome(outcome: &BindingOutcome) {
    let decision = &outcome.decision;
    let latency_ms = outcome.latency().as_secs_f64() * 1000.0;

    if outcome.success {
        info!(
            namespace = %decision.namespace,
            name = %decision.workload_unit_name,
            uid = %decision.workload_unit_uid,
            node = %decision.node_name,
            attempts = outcome.attempts,
            latency_ms,
            "Bound workload unit"
        );
    } else {
        warn!(
            namespace = %decision.namespace,
            name = %decision.workload_unit_name,
            uid = %decision.workload_unit_uid,
            node = %decision.node_name,
            attempts = outcome.attempts,
            latency_ms,
            error = outcome.last_error.as_deref().unwrap_or("unknown"),
            "Failed to bind workload unit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbind_events::{NodeSnapshot, WorkloadUnitSnapshot};

    use crate::client::EmulatedCluster;
    use crate::pool::DispatchOrdering;
    use crate::retry::Backoff;

    fn cluster_with_unit(uid: &str) -> EmulatedCluster {
        let cluster = EmulatedCluster::new();
        cluster.apply_node(NodeSnapshot::new("node-a", "n1"));
        cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "pod-x", uid));
        cluster
    }

    fn binder(cluster: &EmulatedCluster, config: BinderConfig) -> Binder<EmulatedCluster> {
        Binder::new(
            Arc::new(cluster.clone()),
            WorkerPool::new("binder", 10, DispatchOrdering::Unordered),
            config,
        )
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let cluster = cluster_with_unit("111");
        let binder = binder(&cluster, BinderConfig::default());

        let outcome = binder
            .bind(&AssignmentDecision::new("default", "pod-x", "111", "node-a"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.last_error.is_none());
        assert_eq!(cluster.binding_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let cluster = cluster_with_unit("111");
        cluster.fail_next_bindings(1);
        let binder = binder(&cluster, BinderConfig::default());

        let outcome = binder
            .bind(&AssignmentDecision::new("default", "pod-x", "111", "node-a"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_two_attempts() {
        let cluster = cluster_with_unit("111");
        cluster.fail_next_bindings(5);
        let binder = binder(&cluster, BinderConfig::default());

        let outcome = binder
            .bind(&AssignmentDecision::new("default", "pod-x", "111", "node-a"))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.last_error.is_some());
        assert_eq!(cluster.binding_calls(), 2);
    }

    #[tokio::test]
    async fn test_verify_before_retry_detects_landed_bind() {
        let cluster = cluster_with_unit("111");
        cluster.fail_next_bindings_after_commit(1);
        let config = BinderConfig {
            retry: RetryPolicy {
                verify_before_retry: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let binder = binder(&cluster, config);

        let outcome = binder
            .bind(&AssignmentDecision::new("default", "pod-x", "111", "node-a"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.last_error.is_none());
        assert_eq!(cluster.binding_calls(), 1);
    }

    #[tokio::test]
    async fn test_verify_before_retry_stops_on_replaced_unit() {
        let cluster = cluster_with_unit("222");
        let config = BinderConfig {
            retry: RetryPolicy {
                verify_before_retry: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let binder = binder(&cluster, config);

        let outcome = binder
            .bind(&AssignmentDecision::new("default", "pod-x", "111", "node-a"))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.last_error.unwrap().contains("conflict"));
        assert_eq!(cluster.binding_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let cluster = cluster_with_unit("111");
        cluster.fail_next_bindings(1);
        let config = BinderConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Fixed(Duration::from_secs(2)),
                verify_before_retry: false,
            },
            ..Default::default()
        };
        let binder = binder(&cluster, config);

        let outcome = binder
            .bind(&AssignmentDecision::new("default", "pod-x", "111", "node-a"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.latency() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failed_attempt() {
        let cluster = cluster_with_unit("111");
        cluster.set_bind_latency(Duration::from_secs(30));
        let config = BinderConfig {
            call_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let binder = binder(&cluster, config);

        let outcome = binder
            .bind(&AssignmentDecision::new("default", "pod-x", "111", "node-a"))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_bind_many_resolves_each_decision() {
        let cluster = EmulatedCluster::new();
        cluster.apply_node(NodeSnapshot::new("node-a", "n1"));
        let units = cluster.start_deployment("default", "web", 3, "kbind");
        let binder = binder(&cluster, BinderConfig::default());

        let decisions = units
            .iter()
            .map(|u| AssignmentDecision::new("default", u.meta.name.clone(), u.meta.uid.clone(), "node-a"))
            .collect();
        let pending = binder.bind_many(decisions).unwrap();
        assert_eq!(pending.len(), 3);

        for binding in pending {
            let outcome = binding.outcome().await.unwrap();
            assert!(outcome.success);
        }
        assert_eq!(cluster.recorded_bindings().len(), 3);
    }

    #[tokio::test]
    async fn test_bind_many_after_shutdown_fails() {
        let cluster = cluster_with_unit("111");
        let binder = binder(&cluster, BinderConfig::default());
        binder.shutdown(Duration::from_millis(10)).await;

        let result =
            binder.bind_many(vec![AssignmentDecision::new("default", "pod-x", "111", "node-a")]);
        assert!(matches!(result, Err(BindError::Pool(PoolError::Closed(_)))));
    }
}
