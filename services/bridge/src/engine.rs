//! Assignment engine seam.
//!
//! The engine consumes workload unit events from the handoff queue and turns
//! them into assignment decisions; the loop here feeds those decisions to the
//! binder. The engine itself is pluggable. [`RoundRobinEngine`] is a
//! placeholder driver for emulation runs, not a placement policy.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use kbind_events::{Action, AssignmentDecision, Snapshot, WorkloadUnitEvent};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::binder::Binder;
use crate::client::ClusterClient;
use crate::dispatch::WorkloadUnitEvents;
use crate::mirror::MirrorReader;

/// Decides where workload units run.
#[async_trait]
pub trait AssignmentEngine: Send {
    /// React to one workload unit event. May return no decisions.
    async fn decide(&mut self, event: &WorkloadUnitEvent) -> anyhow::Result<Vec<AssignmentDecision>>;
}

/// Drain the handoff queue through `engine` and submit its decisions to
/// `binder` until the queue closes or shutdown is signalled. Returns the
/// number of decisions submitted.
#[instrument(skip_all)]
pub async fn run_assignment_loop<E, C>(
    mut events: WorkloadUnitEvents,
    mut engine: E,
    binder: Arc<Binder<C>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<usize>
where
    E: AssignmentEngine,
    C: ClusterClient,
{
    info!("Assignment loop started");
    let mut submitted = 0;

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = events.recv() => match next {
                Some(event) => event,
                None => {
                    debug!("Handoff queue closed");
                    break;
                }
            },
        };

        let decisions = match engine.decide(&event).await {
            Ok(decisions) => decisions,
            Err(e) => {
                warn!(identity = %event.identity(), error = %e, "Engine failed to decide");
                continue;
            }
        };
        if decisions.is_empty() {
            continue;
        }

        let count = decisions.len();
        // Outcomes are logged by the binder; the handles are not awaited.
        binder
            .bind_many(decisions)
            .context("binding pool rejected decisions")?;
        submitted += count;
    }

    info!(submitted, "Assignment loop stopped");
    Ok(submitted)
}

/// Assigns pending units to schedulable nodes in turn.
pub struct RoundRobinEngine<R: ?Sized> {
    mirror: Arc<R>,
    scheduler_name: String,
    cursor: usize,
    assigned: HashSet<String>,
}

impl<R: MirrorReader + ?Sized> RoundRobinEngine<R> {
    /// Only units naming `scheduler_name` are considered.
    pub fn new(mirror: Arc<R>, scheduler_name: impl Into<String>) -> Self {
        Self {
            mirror,
            scheduler_name: scheduler_name.into(),
            cursor: 0,
            assigned: HashSet::new(),
        }
    }
}

#[async_trait]
impl<R: MirrorReader + ?Sized> AssignmentEngine for RoundRobinEngine<R> {
    async fn decide(&mut self, event: &WorkloadUnitEvent) -> anyhow::Result<Vec<AssignmentDecision>> {
        let unit = event.snapshot();

        if event.action() == Action::Deleted {
            self.assigned.remove(unit.uid());
            return Ok(Vec::new());
        }
        if unit.scheduler_name != self.scheduler_name
            || !unit.awaiting_binding()
            || self.assigned.contains(unit.uid())
        {
            return Ok(Vec::new());
        }

        let nodes: Vec<_> = self
            .mirror
            .list_nodes()
            .await
            .context("failed to list mirrored nodes")?
            .into_iter()
            .filter(|row| !row.deleted && row.snapshot.is_schedulable())
            .collect();

        if nodes.is_empty() {
            debug!(identity = %event.identity(), "No schedulable nodes");
            return Ok(Vec::new());
        }

        let node = &nodes[self.cursor % nodes.len()];
        self.cursor = self.cursor.wrapping_add(1);
        self.assigned.insert(unit.uid().to_string());

        Ok(vec![AssignmentDecision::new(
            unit.namespace(),
            unit.meta.name.clone(),
            unit.uid(),
            node.identity.clone(),
        )])
    }
}
