//! Durable mirror of cluster state.
//!
//! Every normalized lifecycle event is upserted here, keyed by resource
//! identity, before anything downstream sees it. The mirror holds the latest
//! snapshot per identity; deletions are kept as rows with `deleted` set so a
//! reader can tell "gone" from "never seen".
//!
//! Two backends:
//! - [`PgMirror`]: Postgres tables `node_mirror` and `workload_unit_mirror`
//! - [`MemoryMirror`]: in-process maps for tests and emulation runs

mod memory;
mod postgres;

pub use memory::MemoryMirror;
pub use postgres::PgMirror;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbind_events::{
    Action, LifecycleEvent, NodeEvent, NodeSnapshot, Snapshot, WorkloadUnitEvent,
    WorkloadUnitSnapshot,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;

/// Errors from mirror reads and writes.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Database(#[from] DbError),

    /// The backing store refused the operation.
    #[error("mirror unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("corrupt mirror row {identity}: {message}")]
    CorruptRow { identity: String, message: String },
}

pub type MirrorResult<T> = Result<T, MirrorError>;

/// The mirrored state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRow<S> {
    pub identity: String,
    pub uid: String,
    pub last_action: Action,

    /// True when the last recorded event was a deletion.
    pub deleted: bool,

    pub snapshot: S,
    pub resource_version: Option<String>,
    pub observed_at: DateTime<Utc>,
}

pub type NodeRow = MirrorRow<NodeSnapshot>;
pub type WorkloadUnitRow = MirrorRow<WorkloadUnitSnapshot>;

impl<S: Snapshot> MirrorRow<S> {
    /// The row an upsert of this event leaves behind.
    pub fn from_event(event: &LifecycleEvent<S>) -> Self {
        let snapshot = event.snapshot().clone();
        Self {
            identity: event.identity(),
            uid: snapshot.uid().to_string(),
            last_action: event.action(),
            deleted: event.action() == Action::Deleted,
            resource_version: snapshot.meta().resource_version.clone(),
            observed_at: event.observed_at(),
            snapshot,
        }
    }
}

/// Write side of the mirror. Upserts are keyed by identity; the last write
/// wins.
#[async_trait]
pub trait MirrorWriter: Send + Sync + 'static {
    async fn upsert_node_snapshot(&self, event: &NodeEvent) -> MirrorResult<()>;

    async fn upsert_workload_unit_event(&self, event: &WorkloadUnitEvent) -> MirrorResult<()>;
}

/// Read side of the mirror.
#[async_trait]
pub trait MirrorReader: Send + Sync + 'static {
    /// All node rows, ordered by identity.
    async fn list_nodes(&self) -> MirrorResult<Vec<NodeRow>>;

    async fn get_node(&self, name: &str) -> MirrorResult<Option<NodeRow>>;

    /// All workload unit rows, ordered by identity.
    async fn list_workload_units(&self) -> MirrorResult<Vec<WorkloadUnitRow>>;

    /// Look up a workload unit by `namespace/name`.
    async fn get_workload_unit(&self, identity: &str) -> MirrorResult<Option<WorkloadUnitRow>>;
}
