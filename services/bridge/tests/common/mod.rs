#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbind_bridge::client::{
    ApiError, BindingRequest, ClientError, ClusterClient, CurrentBinding, EmulatedCluster,
    WatchStream,
};
use kbind_bridge::mirror::{
    MemoryMirror, MirrorReader, MirrorResult, MirrorWriter, NodeRow, WorkloadUnitRow,
};
use kbind_events::{Action, NodeEvent, NodeSnapshot, WorkloadUnitEvent, WorkloadUnitSnapshot};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kbind_bridge=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// One completed mirror write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub identity: String,
    pub action: Action,
    pub resource_version: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Memory mirror that records every write, can slow writes down, and counts
/// writes in progress.
#[derive(Default)]
pub struct RecordingMirror {
    inner: MemoryMirror,
    log: Mutex<Vec<WriteRecord>>,
    delay: Mutex<Option<Duration>>,
    shrinking_delay: AtomicBool,
    writing: AtomicUsize,
    calls: AtomicUsize,
}

impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every write by `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        let mirror = Self::default();
        *mirror.delay.lock().unwrap() = Some(delay);
        mirror
    }

    /// Each successive write waits less than the one before, so unordered
    /// workers finish later submissions first.
    pub fn with_shrinking_delay(delay: Duration) -> Self {
        let mirror = Self::with_delay(delay);
        mirror.shrinking_delay.store(true, Ordering::SeqCst);
        mirror
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.set_failing(failing);
    }

    pub fn log(&self) -> Vec<WriteRecord> {
        self.log.lock().unwrap().clone()
    }

    /// Writes currently in progress.
    pub fn writing(&self) -> usize {
        self.writing.load(Ordering::SeqCst)
    }

    /// Write attempts, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn memory(&self) -> &MemoryMirror {
        &self.inner
    }

    async fn pause(&self) {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            let delay = if self.shrinking_delay.load(Ordering::SeqCst) {
                delay.checked_div(call + 1).unwrap_or(delay)
            } else {
                delay
            };
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, identity: String, action: Action, rv: Option<String>, at: DateTime<Utc>) {
        self.log.lock().unwrap().push(WriteRecord {
            identity,
            action,
            resource_version: rv,
            observed_at: at,
        });
    }
}

#[async_trait]
impl MirrorWriter for RecordingMirror {
    async fn upsert_node_snapshot(&self, event: &NodeEvent) -> MirrorResult<()> {
        self.writing.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let result = self.inner.upsert_node_snapshot(event).await;
        if result.is_ok() {
            self.record(
                event.identity(),
                event.action(),
                event.snapshot().meta.resource_version.clone(),
                event.observed_at(),
            );
        }
        self.writing.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn upsert_workload_unit_event(&self, event: &WorkloadUnitEvent) -> MirrorResult<()> {
        self.writing.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let result = self.inner.upsert_workload_unit_event(event).await;
        if result.is_ok() {
            self.record(
                event.identity(),
                event.action(),
                event.snapshot().meta.resource_version.clone(),
                event.observed_at(),
            );
        }
        self.writing.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl MirrorReader for RecordingMirror {
    async fn list_nodes(&self) -> MirrorResult<Vec<NodeRow>> {
        self.inner.list_nodes().await
    }

    async fn get_node(&self, name: &str) -> MirrorResult<Option<NodeRow>> {
        self.inner.get_node(name).await
    }

    async fn list_workload_units(&self) -> MirrorResult<Vec<WorkloadUnitRow>> {
        self.inner.list_workload_units().await
    }

    async fn get_workload_unit(&self, identity: &str) -> MirrorResult<Option<WorkloadUnitRow>> {
        self.inner.get_workload_unit(identity).await
    }
}

/// Emulated cluster whose next `n` watch subscriptions fail.
pub struct FlakyWatchClient {
    pub cluster: EmulatedCluster,
    failures_left: AtomicUsize,
}

impl FlakyWatchClient {
    pub fn new(cluster: EmulatedCluster, failures: usize) -> Self {
        Self {
            cluster,
            failures_left: AtomicUsize::new(failures),
        }
    }

    fn should_fail(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ClusterClient for FlakyWatchClient {
    async fn watch_nodes(&self, resync: Duration) -> Result<WatchStream<NodeSnapshot>, ClientError> {
        if self.should_fail() {
            return Err(ClientError::Watch {
                kind: "node",
                source: ApiError::Transport("connection refused".to_string()),
            });
        }
        self.cluster.watch_nodes(resync).await
    }

    async fn watch_workload_units(&self) -> Result<WatchStream<WorkloadUnitSnapshot>, ClientError> {
        self.cluster.watch_workload_units().await
    }

    async fn create_binding(&self, request: &BindingRequest) -> Result<(), ApiError> {
        self.cluster.create_binding(request).await
    }

    async fn current_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CurrentBinding>, ApiError> {
        self.cluster.current_binding(namespace, name).await
    }
}
