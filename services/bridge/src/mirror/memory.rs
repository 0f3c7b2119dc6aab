//! In-process mirror backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kbind_events::{LifecycleEvent, NodeEvent, Snapshot, WorkloadUnitEvent};

use super::{
    MirrorError, MirrorReader, MirrorResult, MirrorRow, MirrorWriter, NodeRow, WorkloadUnitRow,
};

/// Mirror held in memory. Same upsert semantics as [`super::PgMirror`].
#[derive(Default)]
pub struct MemoryMirror {
    nodes: Mutex<HashMap<String, NodeRow>>,
    units: Mutex<HashMap<String, WorkloadUnitRow>>,
    failing: AtomicBool,
    writes: AtomicU64,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn upsert<S: Snapshot>(
        &self,
        table: &Mutex<HashMap<String, MirrorRow<S>>>,
        event: &LifecycleEvent<S>,
    ) -> MirrorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MirrorError::Unavailable("write failure injected".to_string()));
        }

        let row = MirrorRow::from_event(event);
        let mut rows = table
            .lock()
            .map_err(|_| MirrorError::Unavailable("mirror lock poisoned".to_string()))?;
        rows.insert(row.identity.clone(), row);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list<S: Clone>(table: &Mutex<HashMap<String, MirrorRow<S>>>) -> MirrorResult<Vec<MirrorRow<S>>> {
        let rows = table
            .lock()
            .map_err(|_| MirrorError::Unavailable("mirror lock poisoned".to_string()))?;
        let mut out: Vec<_> = rows.values().cloned().collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(out)
    }

    fn get<S: Clone>(
        table: &Mutex<HashMap<String, MirrorRow<S>>>,
        identity: &str,
    ) -> MirrorResult<Option<MirrorRow<S>>> {
        let rows = table
            .lock()
            .map_err(|_| MirrorError::Unavailable("mirror lock poisoned".to_string()))?;
        Ok(rows.get(identity).cloned())
    }
}

#[async_trait]
impl MirrorWriter for MemoryMirror {
    async fn upsert_node_snapshot(&self, event: &NodeEvent) -> MirrorResult<()> {
        self.upsert(&self.nodes, event)
    }

    async fn upsert_workload_unit_event(&self, event: &WorkloadUnitEvent) -> MirrorResult<()> {
        self.upsert(&self.units, event)
    }
}

#[async_trait]
impl MirrorReader for MemoryMirror {
    async fn list_nodes(&self) -> MirrorResult<Vec<NodeRow>> {
        Self::list(&self.nodes)
    }

    async fn get_node(&self, name: &str) -> MirrorResult<Option<NodeRow>> {
        Self::get(&self.nodes, name)
    }

    async fn list_workload_units(&self) -> MirrorResult<Vec<WorkloadUnitRow>> {
        Self::list(&self.units)
    }

    async fn get_workload_unit(&self, identity: &str) -> MirrorResult<Option<WorkloadUnitRow>> {
        Self::get(&self.units, identity)
    }
}
