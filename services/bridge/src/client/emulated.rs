//! In-memory cluster emulation.
//!
//! Implements [`ClusterClient`] without a control plane so traces can be
//! replayed locally and the pipeline can be driven deterministically in
//! tests. Deployments create `<name>-<i>` pending workload units the way a
//! replica controller would; binding calls honor the uid precondition and can
//! be made to fail, stall, or land-then-fail on demand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use kbind_events::{
    workload_unit_identity, NodeSnapshot, ResourceKind, Snapshot, WatchEvent, WatchFault,
    WorkloadUnitSnapshot,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{
    resync_interval, ApiError, BindingRequest, ClientError, ClusterClient, CurrentBinding,
    WatchStream,
};

/// A binding call observed by the emulated cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBinding {
    pub request: BindingRequest,
    pub accepted: bool,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<String, NodeSnapshot>,
    units: BTreeMap<String, WorkloadUnitSnapshot>,
    node_watchers: Vec<mpsc::UnboundedSender<WatchEvent<NodeSnapshot>>>,
    unit_watchers: Vec<mpsc::UnboundedSender<WatchEvent<WorkloadUnitSnapshot>>>,
    bindings: Vec<RecordedBinding>,
}

impl ClusterState {
    fn publish_node(&mut self, event: WatchEvent<NodeSnapshot>) {
        self.node_watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn publish_unit(&mut self, event: WatchEvent<WorkloadUnitSnapshot>) {
        self.unit_watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct Shared {
    state: Mutex<ClusterState>,
    uid_counter: AtomicU64,
    fail_next: AtomicU32,
    fail_after_commit_next: AtomicU32,
    bind_latency_micros: AtomicU64,
    bind_calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Emulated cluster. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EmulatedCluster {
    shared: Arc<Shared>,
}

impl Default for EmulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ClusterState::default()),
                uid_counter: AtomicU64::new(0),
                fail_next: AtomicU32::new(0),
                fail_after_commit_next: AtomicU32::new(0),
                bind_latency_micros: AtomicU64::new(0),
                bind_calls: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate a fresh uid.
    pub fn next_uid(&self) -> String {
        let n = self.shared.uid_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("uid-{n:06}")
    }

    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    /// Add or replace a node.
    pub fn apply_node(&self, node: NodeSnapshot) {
        let mut state = self.state();
        let name = node.identity();
        let event = if state.nodes.insert(name, node.clone()).is_some() {
            WatchEvent::Modified(node)
        } else {
            WatchEvent::Added(node)
        };
        state.publish_node(event);
    }

    /// Remove a node. Returns its last snapshot.
    pub fn remove_node(&self, name: &str) -> Option<NodeSnapshot> {
        let mut state = self.state();
        let removed = state.nodes.remove(name)?;
        state.publish_node(WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    pub fn node(&self, name: &str) -> Option<NodeSnapshot> {
        self.state().nodes.get(name).cloned()
    }

    // -------------------------------------------------------------------------
    // Workload units
    // -------------------------------------------------------------------------

    /// Add or replace a workload unit.
    pub fn apply_workload_unit(&self, unit: WorkloadUnitSnapshot) {
        let mut state = self.state();
        let identity = unit.identity();
        let event = if state.units.insert(identity, unit.clone()).is_some() {
            WatchEvent::Modified(unit)
        } else {
            WatchEvent::Added(unit)
        };
        state.publish_unit(event);
    }

    /// Delete a workload unit. Returns its last snapshot.
    pub fn delete_workload_unit(&self, namespace: &str, name: &str) -> Option<WorkloadUnitSnapshot> {
        let mut state = self.state();
        let removed = state.units.remove(&workload_unit_identity(namespace, name))?;
        state.publish_unit(WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    pub fn workload_unit(&self, namespace: &str, name: &str) -> Option<WorkloadUnitSnapshot> {
        self.state()
            .units
            .get(&workload_unit_identity(namespace, name))
            .cloned()
    }

    /// Create `replicas` pending units named `<deployment>-<i>` owned by the
    /// deployment.
    pub fn start_deployment(
        &self,
        namespace: &str,
        deployment: &str,
        replicas: u32,
        scheduler_name: &str,
    ) -> Vec<WorkloadUnitSnapshot> {
        info!(
            namespace,
            deployment,
            replicas,
            scheduler_name,
            "Creating emulated deployment"
        );

        (0..replicas)
            .map(|i| self.create_replica(namespace, deployment, i, scheduler_name))
            .collect()
    }

    /// Like [`start_deployment`](Self::start_deployment), but creates at most
    /// `per_second` units per second. Zero means unpaced.
    pub async fn start_deployment_paced(
        &self,
        namespace: &str,
        deployment: &str,
        replicas: u32,
        scheduler_name: &str,
        per_second: u32,
    ) -> Vec<WorkloadUnitSnapshot> {
        if per_second == 0 {
            return self.start_deployment(namespace, deployment, replicas, scheduler_name);
        }

        info!(
            namespace,
            deployment,
            replicas,
            scheduler_name,
            per_second,
            "Creating emulated deployment"
        );

        let period = (Duration::from_secs(1) / per_second).max(Duration::from_micros(1));
        let mut pacer = tokio::time::interval(period);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut units = Vec::with_capacity(replicas as usize);
        for i in 0..replicas {
            pacer.tick().await;
            units.push(self.create_replica(namespace, deployment, i, scheduler_name));
        }
        units
    }

    fn create_replica(
        &self,
        namespace: &str,
        deployment: &str,
        index: u32,
        scheduler_name: &str,
    ) -> WorkloadUnitSnapshot {
        let mut unit = WorkloadUnitSnapshot::pending(
            namespace,
            format!("{deployment}-{index}"),
            self.next_uid(),
        );
        unit.meta.owner = Some(deployment.to_string());
        unit.scheduler_name = scheduler_name.to_string();
        self.apply_workload_unit(unit.clone());
        unit
    }

    /// Delete every unit owned by the deployment. Returns how many were removed.
    pub fn end_deployment(&self, namespace: &str, deployment: &str) -> usize {
        let mut state = self.state();
        let owned: Vec<String> = state
            .units
            .iter()
            .filter(|(_, u)| {
                u.namespace() == namespace && u.meta.owner.as_deref() == Some(deployment)
            })
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in &owned {
            if let Some(removed) = state.units.remove(identity) {
                state.publish_unit(WatchEvent::Deleted(removed));
            }
        }

        info!(namespace, deployment, removed = owned.len(), "Ended emulated deployment");
        owned.len()
    }

    /// Push a stream fault to every watcher of `kind`.
    pub fn inject_watch_fault(&self, kind: ResourceKind, message: &str) {
        let fault = WatchFault {
            kind,
            code: Some(500),
            message: message.to_string(),
        };
        let mut state = self.state();
        match kind {
            ResourceKind::Node => state.publish_node(WatchEvent::Error(fault)),
            ResourceKind::WorkloadUnit => state.publish_unit(WatchEvent::Error(fault)),
        }
    }

    // -------------------------------------------------------------------------
    // Binding controls and counters
    // -------------------------------------------------------------------------

    /// Reject the next `n` binding calls with a 500 before touching state.
    pub fn fail_next_bindings(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` binding calls but report them as timed out.
    pub fn fail_next_bindings_after_commit(&self, n: u32) {
        self.shared.fail_after_commit_next.store(n, Ordering::SeqCst);
    }

    /// Delay every binding call by `latency`.
    pub fn set_bind_latency(&self, latency: Duration) {
        self.shared
            .bind_latency_micros
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    /// Total binding calls received.
    pub fn binding_calls(&self) -> u32 {
        self.shared.bind_calls.load(Ordering::SeqCst)
    }

    /// Highest number of binding calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every binding call seen so far, in arrival order.
    pub fn recorded_bindings(&self) -> Vec<RecordedBinding> {
        self.state().bindings.clone()
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn commit_binding(&self, request: &BindingRequest) -> Result<(), ApiError> {
        let mut state = self.state();
        let identity = workload_unit_identity(&request.namespace, &request.workload_unit_name);

        let result = match state.units.get_mut(&identity) {
            None => Err(ApiError::NotFound(identity.clone())),
            Some(unit) if unit.meta.uid != request.workload_unit_uid => Err(ApiError::Conflict(
                format!(
                    "uid precondition failed for {identity}: have {}, want {}",
                    unit.meta.uid, request.workload_unit_uid
                ),
            )),
            Some(unit) if unit.node_name.is_some() => Err(ApiError::Conflict(format!(
                "{identity} is already bound to {}",
                unit.node_name.as_deref().unwrap_or_default()
            ))),
            Some(unit) => {
                unit.node_name = Some(request.node_name.clone());
                Ok(unit.clone())
            }
        };

        state.bindings.push(RecordedBinding {
            request: request.clone(),
            accepted: result.is_ok(),
        });

        result.map(|bound| state.publish_unit(WatchEvent::Modified(bound)))
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(in_flight: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(in_flight)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn receiver_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> impl futures_core::Stream<Item = T> + Send + 'static {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

#[async_trait]
impl ClusterClient for EmulatedCluster {
    async fn watch_nodes(&self, resync: Duration) -> Result<WatchStream<NodeSnapshot>, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            for node in state.nodes.values() {
                let _ = tx.send(WatchEvent::Added(node.clone()));
            }
            state.node_watchers.push(tx);
        }

        let cluster = self.clone();
        let ticker = resync_interval(resync);
        let resyncs = stream::unfold((cluster, ticker), |(cluster, mut ticker)| async move {
            ticker.tick().await;
            let nodes: Vec<_> = cluster.state().nodes.values().cloned().collect();
            debug!(count = nodes.len(), "Emulated node resync");
            Some((stream::iter(nodes.into_iter().map(WatchEvent::Modified)), (cluster, ticker)))
        })
        .flatten();

        Ok(Box::pin(stream::select(receiver_stream(rx), resyncs)))
    }

    async fn watch_workload_units(&self) -> Result<WatchStream<WorkloadUnitSnapshot>, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        for unit in state.units.values() {
            let _ = tx.send(WatchEvent::Added(unit.clone()));
        }
        state.unit_watchers.push(tx);

        Ok(Box::pin(receiver_stream(rx)))
    }

    async fn create_binding(&self, request: &BindingRequest) -> Result<(), ApiError> {
        self.shared.bind_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard::enter(&self.shared.in_flight, &self.shared.max_in_flight);

        let latency = self.shared.bind_latency_micros.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }

        if Self::take_one(&self.shared.fail_next) {
            self.state().bindings.push(RecordedBinding {
                request: request.clone(),
                accepted: false,
            });
            return Err(ApiError::Status {
                code: 500,
                message: "injected binding failure".to_string(),
            });
        }

        self.commit_binding(request)?;

        if Self::take_one(&self.shared.fail_after_commit_next) {
            return Err(ApiError::Timeout(Duration::from_micros(latency)));
        }

        Ok(())
    }

    async fn current_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CurrentBinding>, ApiError> {
        Ok(self.workload_unit(namespace, name).map(|unit| CurrentBinding {
            uid: unit.meta.uid,
            node_name: unit.node_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_replays_existing_units_then_follows() {
        let cluster = EmulatedCluster::new();
        cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "a", "1"));

        let mut watch = cluster.watch_workload_units().await.unwrap();
        cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "b", "2"));
        cluster.delete_workload_unit("default", "a");

        assert!(matches!(watch.next().await, Some(WatchEvent::Added(u)) if u.meta.name == "a"));
        assert!(matches!(watch.next().await, Some(WatchEvent::Added(u)) if u.meta.name == "b"));
        assert!(matches!(watch.next().await, Some(WatchEvent::Deleted(u)) if u.meta.name == "a"));
    }

    #[tokio::test]
    async fn test_binding_checks_uid() {
        let cluster = EmulatedCluster::new();
        cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "pod-x", "222"));

        let stale = BindingRequest {
            namespace: "default".to_string(),
            workload_unit_name: "pod-x".to_string(),
            workload_unit_uid: "111".to_string(),
            node_name: "node-b".to_string(),
        };
        assert!(matches!(
            cluster.create_binding(&stale).await,
            Err(ApiError::Conflict(_))
        ));

        let fresh = BindingRequest {
            workload_unit_uid: "222".to_string(),
            ..stale
        };
        cluster.create_binding(&fresh).await.unwrap();

        let unit = cluster.workload_unit("default", "pod-x").unwrap();
        assert_eq!(unit.node_name.as_deref(), Some("node-b"));
        assert_eq!(cluster.binding_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let cluster = EmulatedCluster::new();
        cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "p", "1"));
        cluster.fail_next_bindings(1);

        let request = BindingRequest {
            namespace: "default".to_string(),
            workload_unit_name: "p".to_string(),
            workload_unit_uid: "1".to_string(),
            node_name: "n".to_string(),
        };
        assert!(cluster.create_binding(&request).await.is_err());
        assert!(cluster.create_binding(&request).await.is_ok());

        let recorded = cluster.recorded_bindings();
        assert_eq!(recorded.len(), 2);
        assert!(!recorded[0].accepted);
        assert!(recorded[1].accepted);
    }

    #[tokio::test]
    async fn test_deployment_lifecycle() {
        let cluster = EmulatedCluster::new();
        let units = cluster.start_deployment("web", "frontend", 3, "kbind");

        assert_eq!(units.len(), 3);
        assert_eq!(units[2].meta.name, "frontend-2");
        assert!(units.iter().all(|u| u.awaiting_binding()));
        assert_eq!(cluster.end_deployment("web", "frontend"), 3);
        assert!(cluster.workload_unit("web", "frontend-0").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_deployment_respects_creation_rate() {
        let cluster = EmulatedCluster::new();
        let start = tokio::time::Instant::now();

        let units = cluster
            .start_deployment_paced("default", "web", 21, "kbind", 10)
            .await;

        assert_eq!(units.len(), 21);
        // The first unit is created at once, each later one 100ms apart.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2100));
        assert!(cluster.workload_unit("default", "web-20").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpaced_deployment_is_immediate() {
        let cluster = EmulatedCluster::new();
        let start = tokio::time::Instant::now();

        let units = cluster
            .start_deployment_paced("default", "web", 50, "kbind", 0)
            .await;

        assert_eq!(units.len(), 50);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_resync_watch_does_not_panic() {
        let cluster = EmulatedCluster::new();
        cluster.apply_node(NodeSnapshot::new("node-a", "n1"));

        let mut watch = cluster.watch_nodes(Duration::ZERO).await.unwrap();
        assert!(matches!(watch.next().await, Some(WatchEvent::Added(_))));
        assert!(matches!(watch.next().await, Some(WatchEvent::Modified(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_watch_resyncs() {
        let cluster = EmulatedCluster::new();
        cluster.apply_node(NodeSnapshot::new("node-a", "n1"));

        let mut watch = cluster.watch_nodes(Duration::from_secs(30)).await.unwrap();
        assert!(matches!(watch.next().await, Some(WatchEvent::Added(_))));

        // Paused clock auto-advances to the next resync tick.
        assert!(matches!(watch.next().await, Some(WatchEvent::Modified(n)) if n.meta.name == "node-a"));
    }
}
