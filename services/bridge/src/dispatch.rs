//! Event normalization, dispatch, and the handoff queue.
//!
//! Each raw watch callback becomes one unit of work on the dispatch pool:
//! normalize, upsert into the mirror, then (workload units only) push onto the
//! handoff queue. The mirror write always precedes the push for the same
//! event, so a consumer of the queue can rely on the mirror having seen it.
//! A failed write is logged and the event is still handed off.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use kbind_events::{
    NodeSnapshot, Snapshot, WatchEvent, WatchFault, WorkloadUnitEvent, WorkloadUnitSnapshot,
};
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

use crate::mirror::MirrorWriter;
use crate::pool::{PoolError, WorkerPool};

/// Default bound of the handoff queue.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 1024;

/// Create a bounded handoff queue.
pub fn handoff_channel(capacity: usize) -> (HandoffQueue, WorkloadUnitEvents) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (HandoffQueue { tx }, WorkloadUnitEvents { rx })
}

/// Producer side of the handoff queue.
#[derive(Clone)]
pub struct HandoffQueue {
    tx: mpsc::Sender<WorkloadUnitEvent>,
}

impl HandoffQueue {
    /// Push an event, waiting while the queue is full. Returns false if the
    /// consumer has gone away.
    pub async fn push(&self, event: WorkloadUnitEvent) -> bool {
        let identity = event.identity();
        let action = event.action();
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                error!(
                    identity = %identity,
                    action = %action,
                    "Handoff consumer is gone; dropping workload unit event"
                );
                false
            }
        }
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer side of the handoff queue: every normalized workload-unit event,
/// in the order dispatch workers pushed them.
pub struct WorkloadUnitEvents {
    rx: mpsc::Receiver<WorkloadUnitEvent>,
}

impl WorkloadUnitEvents {
    /// Wait for the next event. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<WorkloadUnitEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is ready.
    pub fn try_recv(&mut self) -> Option<WorkloadUnitEvent> {
        self.rx.try_recv().ok()
    }

    /// Events currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Stream for WorkloadUnitEvents {
    type Item = WorkloadUnitEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Turns raw callbacks into mirror writes and handoffs.
pub struct EventDispatcher<M: ?Sized> {
    mirror: Arc<M>,
    pool: Arc<WorkerPool>,
    handoff: HandoffQueue,
}

impl<M: ?Sized> Clone for EventDispatcher<M> {
    fn clone(&self) -> Self {
        Self {
            mirror: self.mirror.clone(),
            pool: self.pool.clone(),
            handoff: self.handoff.clone(),
        }
    }
}

impl<M: MirrorWriter + ?Sized> EventDispatcher<M> {
    pub fn new(mirror: Arc<M>, pool: Arc<WorkerPool>, handoff: HandoffQueue) -> Self {
        Self {
            mirror,
            pool,
            handoff,
        }
    }

    /// Dispatch a node callback. Faults and nameless snapshots are logged and
    /// dropped; only a closed pool is an error.
    pub fn dispatch_node(&self, raw: WatchEvent<NodeSnapshot>) -> Result<(), PoolError> {
        log_received(&raw);
        let event = match raw {
            WatchEvent::Error(fault) => {
                log_fault(&fault);
                return Ok(());
            }
            raw => match raw.into_lifecycle() {
                Ok(event) => event,
                Err(e) => {
                    warn!(kind = "node", error = %e, "Rejecting node event");
                    return Ok(());
                }
            },
        };

        let mirror = self.mirror.clone();
        let identity = event.identity();
        self.pool.submit(&identity, async move {
            if let Err(e) = mirror.upsert_node_snapshot(&event).await {
                warn!(
                    identity = %event.identity(),
                    action = %event.action(),
                    error = %e,
                    "Failed to mirror node event"
                );
            }
        })
    }

    /// Dispatch a workload unit callback: mirror write, then handoff.
    pub fn dispatch_workload_unit(
        &self,
        raw: WatchEvent<WorkloadUnitSnapshot>,
    ) -> Result<(), PoolError> {
        log_received(&raw);
        let event = match raw {
            WatchEvent::Error(fault) => {
                log_fault(&fault);
                return Ok(());
            }
            raw => match raw.into_lifecycle() {
                Ok(event) => event,
                Err(e) => {
                    warn!(kind = "workload_unit", error = %e, "Rejecting workload unit event");
                    return Ok(());
                }
            },
        };

        let mirror = self.mirror.clone();
        let handoff = self.handoff.clone();
        let identity = event.identity();
        self.pool.submit(&identity, async move {
            if let Err(e) = mirror.upsert_workload_unit_event(&event).await {
                warn!(
                    identity = %event.identity(),
                    action = %event.action(),
                    error = %e,
                    "Failed to mirror workload unit event"
                );
            }
            handoff.push(event).await;
        })
    }
}

fn log_received<S: Snapshot>(raw: &WatchEvent<S>) {
    let identity = raw.snapshot().map(|s| s.identity()).unwrap_or_default();
    trace!(kind = %S::kind(), event = raw.label(), identity = %identity, "Received");
}

fn log_fault(fault: &WatchFault) {
    warn!(
        kind = %fault.kind,
        code = ?fault.code,
        message = %fault.message,
        "Watch reported a fault; nothing dispatched"
    );
}
