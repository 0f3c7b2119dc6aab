//! State synchronizer.
//!
//! Owns the two watches. On `start` it opens a resync-driven node watch and an
//! event-driven workload unit watch, then runs one pump task per watch that
//! feeds raw callbacks to the dispatcher. Lifecycle:
//!
//! ```text
//! Created --configure--> Configured --start--> Running --stop--> Stopped
//! ```
//!
//! A failed `start` leaves the synchronizer `Configured` so the caller may
//! retry. `stop` halts the pumps, then drains the dispatch pool; once it
//! returns no dispatch work runs.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kbind_events::{ResourceKind, Snapshot, WatchEvent};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::client::{ClientError, ClusterClient, WatchStream};
use crate::dispatch::{handoff_channel, EventDispatcher, WorkloadUnitEvents, DEFAULT_HANDOFF_CAPACITY};
use crate::mirror::MirrorWriter;
use crate::pool::{PoolError, ShutdownReport, WorkerPool};

/// Synchronizer settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval at which cached nodes are re-delivered.
    pub node_resync: Duration,

    /// Bound of the handoff queue.
    pub handoff_capacity: usize,

    /// Upper bound for each phase of `stop`.
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_resync: Duration::from_millis(30_000),
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Created,
    Configured,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("synchronizer is not configured")]
    NotConfigured,

    #[error("synchronizer is already configured")]
    AlreadyConfigured,

    #[error("synchronizer is already started")]
    AlreadyStarted,

    #[error("synchronizer is stopped")]
    Stopped,

    #[error(transparent)]
    Watch(#[from] ClientError),
}

/// Keeps the mirror and the handoff queue in step with the cluster.
pub struct StateSync<C: ClusterClient> {
    client: Arc<C>,
    pool: Arc<WorkerPool>,
    config: SyncConfig,
    state: SyncState,
    dispatcher: Option<EventDispatcher<dyn MirrorWriter>>,
    shutdown_tx: watch::Sender<bool>,
    pumps: Vec<JoinHandle<()>>,
    last_report: Option<ShutdownReport>,
}

impl<C: ClusterClient> StateSync<C> {
    /// Build a synchronizer that dispatches on `pool`.
    pub fn new(client: Arc<C>, pool: WorkerPool, config: SyncConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            pool: Arc::new(pool),
            config,
            state: SyncState::Created,
            dispatcher: None,
            shutdown_tx,
            pumps: Vec::new(),
            last_report: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Attach the mirror writer and create the handoff queue. Returns the
    /// queue's consumer side.
    pub fn configure<M: MirrorWriter>(
        &mut self,
        mirror: Arc<M>,
    ) -> Result<WorkloadUnitEvents, SyncError> {
        match self.state {
            SyncState::Created => {}
            SyncState::Configured => return Err(SyncError::AlreadyConfigured),
            SyncState::Running => return Err(SyncError::AlreadyStarted),
            SyncState::Stopped => return Err(SyncError::Stopped),
        }

        let (handoff, events) = handoff_channel(self.config.handoff_capacity);
        let mirror: Arc<dyn MirrorWriter> = mirror;
        self.dispatcher = Some(EventDispatcher::new(mirror, self.pool.clone(), handoff));
        self.state = SyncState::Configured;
        Ok(events)
    }

    /// Open both watches and begin dispatching.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        let dispatcher = match self.state {
            SyncState::Created => return Err(SyncError::NotConfigured),
            SyncState::Running => return Err(SyncError::AlreadyStarted),
            SyncState::Stopped => return Err(SyncError::Stopped),
            SyncState::Configured => self.dispatcher.clone().ok_or(SyncError::NotConfigured)?,
        };

        let nodes = self.client.watch_nodes(self.config.node_resync).await?;
        let units = self.client.watch_workload_units().await?;

        let node_dispatcher = dispatcher.clone();
        self.pumps.push(tokio::spawn(pump(
            ResourceKind::Node,
            nodes,
            self.shutdown_tx.subscribe(),
            move |event| node_dispatcher.dispatch_node(event),
        )));
        self.pumps.push(tokio::spawn(pump(
            ResourceKind::WorkloadUnit,
            units,
            self.shutdown_tx.subscribe(),
            move |event| dispatcher.dispatch_workload_unit(event),
        )));

        self.state = SyncState::Running;
        info!(
            node_resync_ms = self.config.node_resync.as_millis() as u64,
            dispatch_workers = self.pool.size(),
            ordering = ?self.pool.ordering(),
            "State sync started"
        );
        Ok(())
    }

    /// Stop the watches and drain dispatch work. Stopping twice is a no-op.
    pub async fn stop(&mut self) -> Result<ShutdownReport, SyncError> {
        if let Some(report) = self.last_report {
            return Ok(report);
        }

        info!(pumps = self.pumps.len(), "Stopping state sync");
        let _ = self.shutdown_tx.send(true);

        let timeout = self.config.shutdown_timeout;
        let joined = tokio::time::timeout(timeout, async {
            for pump in self.pumps.iter_mut() {
                let _ = pump.await;
            }
        })
        .await;
        if joined.is_err() {
            warn!("Watch pumps did not stop in time; aborting");
            for pump in &self.pumps {
                pump.abort();
            }
        }
        self.pumps.clear();

        // Dropping the dispatcher releases the last handoff producer once the
        // pool drains, which ends the consumer's stream.
        self.dispatcher = None;
        let report = self.pool.shutdown(timeout).await;

        self.state = SyncState::Stopped;
        self.last_report = Some(report);
        Ok(report)
    }
}

/// Forward one watch into the dispatcher until shutdown or stream end.
#[instrument(skip_all, fields(kind = %kind))]
async fn pump<S, F>(
    kind: ResourceKind,
    mut stream: WatchStream<S>,
    mut shutdown: watch::Receiver<bool>,
    dispatch: F,
) where
    S: Snapshot,
    F: Fn(WatchEvent<S>) -> Result<(), PoolError> + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = stream.next() => match next {
                Some(event) => {
                    if let Err(e) = dispatch(event) {
                        warn!(error = %e, "Dispatch pool closed; watch pump exiting");
                        break;
                    }
                }
                None => {
                    warn!("Watch stream ended");
                    break;
                }
            },
        }
    }
}
