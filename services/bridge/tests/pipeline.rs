//! Watch → mirror → handoff pipeline against the emulated cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, wait_until, FlakyWatchClient, RecordingMirror};
use kbind_bridge::client::EmulatedCluster;
use kbind_bridge::dispatch::{handoff_channel, EventDispatcher};
use kbind_bridge::mirror::MirrorReader;
use kbind_bridge::pool::{DispatchOrdering, WorkerPool};
use kbind_bridge::sync::{StateSync, SyncConfig, SyncError, SyncState};
use kbind_events::{
    Action, NodeSnapshot, ResourceKind, WatchEvent, WorkloadUnitEvent, WorkloadUnitSnapshot,
};
use rstest::rstest;

const WAIT: Duration = Duration::from_secs(5);

fn start_sync<C: kbind_bridge::client::ClusterClient>(
    client: Arc<C>,
    ordering: DispatchOrdering,
    config: SyncConfig,
) -> StateSync<C> {
    StateSync::new(client, WorkerPool::new("dispatch", 10, ordering), config)
}

fn unit_with_rv(name: &str, uid: &str, rv: &str) -> WorkloadUnitSnapshot {
    let mut unit = WorkloadUnitSnapshot::pending("default", name, uid);
    unit.meta.resource_version = Some(rv.to_string());
    unit
}

#[rstest]
#[case::unordered(DispatchOrdering::Unordered)]
#[case::per_object(DispatchOrdering::PerObject)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mirror_write_precedes_handoff(#[case] ordering: DispatchOrdering) {
    init_tracing();
    let cluster = EmulatedCluster::new();
    cluster.start_deployment("default", "web", 20, "kbind");

    let mirror = Arc::new(RecordingMirror::with_shrinking_delay(Duration::from_millis(20)));
    let mut sync = start_sync(Arc::new(cluster.clone()), ordering, SyncConfig::default());
    let mut events = sync.configure(mirror.clone()).unwrap();
    sync.start().await.unwrap();

    for _ in 0..20 {
        let event = events.recv().await.unwrap();
        let written = mirror.log().into_iter().any(|w| {
            w.identity == event.identity()
                && w.action == event.action()
                && w.observed_at == event.observed_at()
        });
        assert!(written, "{} handed off before it was mirrored", event.identity());
    }

    sync.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_added_yields_one_row() {
    let mirror = Arc::new(RecordingMirror::new());
    let pool = Arc::new(WorkerPool::new("dispatch", 4, DispatchOrdering::Unordered));
    let (handoff, mut events) = handoff_channel(16);
    let dispatcher = EventDispatcher::new(mirror.clone(), pool.clone(), handoff);

    let unit = WorkloadUnitSnapshot::pending("default", "pod-a", "1");
    dispatcher.dispatch_workload_unit(WatchEvent::Added(unit.clone())).unwrap();
    dispatcher.dispatch_workload_unit(WatchEvent::Added(unit)).unwrap();

    events.recv().await.unwrap();
    events.recv().await.unwrap();
    pool.shutdown(WAIT).await;

    assert_eq!(mirror.log().len(), 2);
    assert_eq!(mirror.list_workload_units().await.unwrap().len(), 1);
}

#[tokio::test]
async fn resynced_node_has_single_row() {
    let cluster = EmulatedCluster::new();
    cluster.apply_node(NodeSnapshot::new("node-a", "n1"));

    let mirror = Arc::new(RecordingMirror::new());
    let config = SyncConfig {
        node_resync: Duration::from_millis(20),
        ..Default::default()
    };
    let mut sync = start_sync(Arc::new(cluster.clone()), DispatchOrdering::Unordered, config);
    let _events = sync.configure(mirror.clone()).unwrap();
    sync.start().await.unwrap();

    // The initial Added plus at least two resyncs.
    let resynced = wait_until(WAIT, || {
        let mirror = mirror.clone();
        async move {
            mirror
                .log()
                .iter()
                .filter(|w| w.identity == "node-a" && w.action == Action::Updated)
                .count()
                >= 2
        }
    })
    .await;
    assert!(resynced);

    sync.stop().await.unwrap();
    let rows = mirror.list_nodes().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].identity, "node-a");
}

#[tokio::test]
async fn recreated_unit_is_mirrored_with_new_uid() {
    let cluster = EmulatedCluster::new();
    cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "pod-x", "111"));

    let mirror = Arc::new(RecordingMirror::new());
    let mut sync = start_sync(
        Arc::new(cluster.clone()),
        DispatchOrdering::PerObject,
        SyncConfig::default(),
    );
    let mut events = sync.configure(mirror.clone()).unwrap();
    sync.start().await.unwrap();

    cluster.delete_workload_unit("default", "pod-x");
    cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "pod-x", "222"));

    let seen: Vec<(Action, String)> = collect(&mut events, 3)
        .await
        .into_iter()
        .map(|e| (e.action(), e.snapshot().meta.uid.clone()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (Action::Added, "111".to_string()),
            (Action::Deleted, "111".to_string()),
            (Action::Added, "222".to_string()),
        ]
    );

    let row = mirror.get_workload_unit("default/pod-x").await.unwrap().unwrap();
    assert_eq!(row.uid, "222");
    assert!(!row.deleted);

    sync.stop().await.unwrap();
}

#[tokio::test]
async fn per_object_ordering_holds_under_uneven_writes() {
    let mirror = Arc::new(RecordingMirror::with_shrinking_delay(Duration::from_millis(30)));
    let pool = Arc::new(WorkerPool::new("dispatch", 10, DispatchOrdering::PerObject));
    let (handoff, mut events) = handoff_channel(16);
    let dispatcher = EventDispatcher::new(mirror.clone(), pool.clone(), handoff);

    dispatcher
        .dispatch_workload_unit(WatchEvent::Added(unit_with_rv("pod-a", "1", "1")))
        .unwrap();
    dispatcher
        .dispatch_workload_unit(WatchEvent::Modified(unit_with_rv("pod-a", "1", "2")))
        .unwrap();
    dispatcher
        .dispatch_workload_unit(WatchEvent::Modified(unit_with_rv("pod-a", "1", "3")))
        .unwrap();

    let handed_off: Vec<_> = collect(&mut events, 3)
        .await
        .into_iter()
        .map(|e| e.snapshot().meta.resource_version.clone().unwrap())
        .collect();
    assert_eq!(handed_off, ["1", "2", "3"]);

    let written: Vec<_> = mirror
        .log()
        .into_iter()
        .map(|w| w.resource_version.unwrap())
        .collect();
    assert_eq!(written, ["1", "2", "3"]);

    let row = mirror.get_workload_unit("default/pod-a").await.unwrap().unwrap();
    assert_eq!(row.resource_version.as_deref(), Some("3"));
}

#[tokio::test]
async fn failing_writer_still_hands_off_everything() {
    let cluster = EmulatedCluster::new();
    cluster.start_deployment("default", "web", 5, "kbind");

    let mirror = Arc::new(RecordingMirror::new());
    mirror.set_failing(true);
    let mut sync = start_sync(
        Arc::new(cluster.clone()),
        DispatchOrdering::Unordered,
        SyncConfig::default(),
    );
    let mut events = sync.configure(mirror.clone()).unwrap();
    sync.start().await.unwrap();

    let received = collect(&mut events, 5).await;
    assert_eq!(received.len(), 5);
    assert!(mirror.log().is_empty());
    assert!(mirror.list_workload_units().await.unwrap().is_empty());

    sync.stop().await.unwrap();
}

#[tokio::test]
async fn watch_faults_are_not_dispatched() {
    let cluster = EmulatedCluster::new();
    let mirror = Arc::new(RecordingMirror::new());
    let mut sync = start_sync(
        Arc::new(cluster.clone()),
        DispatchOrdering::Unordered,
        SyncConfig::default(),
    );
    let mut events = sync.configure(mirror.clone()).unwrap();
    sync.start().await.unwrap();

    cluster.inject_watch_fault(ResourceKind::Node, "etcd leader changed");
    cluster.inject_watch_fault(ResourceKind::WorkloadUnit, "too old resource version");
    // A real event afterwards proves the pump kept running past the faults.
    cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "pod-a", "1"));

    let event = events.recv().await.unwrap();
    assert_eq!(event.identity(), "default/pod-a");

    sync.stop().await.unwrap();
    assert_eq!(mirror.calls(), 1);
    assert!(events.try_recv().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_waits_for_in_flight_dispatch_then_stops_dispatching() {
    init_tracing();
    let cluster = EmulatedCluster::new();
    cluster.start_deployment("default", "web", 3, "kbind");

    let mirror = Arc::new(RecordingMirror::with_delay(Duration::from_millis(200)));
    let mut sync = start_sync(
        Arc::new(cluster.clone()),
        DispatchOrdering::Unordered,
        SyncConfig::default(),
    );
    let mut events = sync.configure(mirror.clone()).unwrap();
    sync.start().await.unwrap();

    let all_writing = wait_until(WAIT, || {
        let mirror = mirror.clone();
        async move { mirror.writing() == 3 }
    })
    .await;
    assert!(all_writing);

    let report = sync.stop().await.unwrap();
    assert_eq!(report.completed, 3);
    assert_eq!(report.aborted, 0);
    assert_eq!(mirror.log().len(), 3);
    assert_eq!(sync.state(), SyncState::Stopped);

    // Nothing new is dispatched once stop has returned.
    cluster.start_deployment("default", "late", 2, "kbind");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mirror.calls(), 3);

    assert_eq!(collect(&mut events, 3).await.len(), 3);
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn stop_gives_up_after_timeout() {
    let cluster = EmulatedCluster::new();
    cluster.start_deployment("default", "web", 3, "kbind");

    let mirror = Arc::new(RecordingMirror::with_delay(Duration::from_secs(60)));
    let config = SyncConfig {
        shutdown_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let mut sync = start_sync(Arc::new(cluster.clone()), DispatchOrdering::Unordered, config);
    let _events = sync.configure(mirror.clone()).unwrap();
    sync.start().await.unwrap();

    assert!(
        wait_until(WAIT, || {
            let mirror = mirror.clone();
            async move { mirror.writing() == 3 }
        })
        .await
    );

    let started = std::time::Instant::now();
    let report = sync.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.aborted, 3);
    assert!(mirror.log().is_empty());
}

#[tokio::test]
async fn failed_start_can_be_retried() {
    let cluster = EmulatedCluster::new();
    cluster.apply_workload_unit(WorkloadUnitSnapshot::pending("default", "pod-a", "1"));
    let client = Arc::new(FlakyWatchClient::new(cluster, 1));

    let mirror = Arc::new(RecordingMirror::new());
    let mut sync = start_sync(client, DispatchOrdering::Unordered, SyncConfig::default());
    let mut events = sync.configure(mirror.clone()).unwrap();

    assert!(matches!(sync.start().await, Err(SyncError::Watch(_))));
    assert_eq!(sync.state(), SyncState::Configured);

    sync.start().await.unwrap();
    assert_eq!(sync.state(), SyncState::Running);
    assert_eq!(events.recv().await.unwrap().identity(), "default/pod-a");

    sync.stop().await.unwrap();
}

async fn collect(
    events: &mut kbind_bridge::dispatch::WorkloadUnitEvents,
    n: usize,
) -> Vec<WorkloadUnitEvent> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        match tokio::time::timeout(WAIT, events.recv()).await {
            Ok(Some(event)) => out.push(event),
            _ => break,
        }
    }
    out
}
