//! Point-in-time views of cluster resources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The kind of resource a snapshot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A cluster member capable of running workload units.
    Node,
    /// A schedulable unit of work.
    WorkloadUnit,
}

impl ResourceKind {
    /// Stable label used in logs and store columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Node => "node",
            ResourceKind::WorkloadUnit => "workload_unit",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata common to every resource reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object name, unique within its namespace (or cluster for nodes).
    pub name: String,

    /// Namespace; `None` for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Control-plane assigned unique identifier. Differs between a deleted
    /// object and a re-created one with the same name.
    pub uid: String,

    /// Opaque version used to resume watches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Name of the controlling owner, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl ObjectMeta {
    /// Metadata for a cluster-scoped object.
    pub fn cluster_scoped(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            ..Default::default()
        }
    }

    /// Metadata for a namespaced object.
    pub fn namespaced(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            uid: uid.into(),
            ..Default::default()
        }
    }
}

/// A node taint that repels workload units without a matching toleration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub effect: String,
}

/// Snapshot of an execution node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub meta: ObjectMeta,

    /// Cordoned nodes accept no new workload units.
    #[serde(default)]
    pub unschedulable: bool,

    /// Whether the node reports the Ready condition.
    #[serde(default)]
    pub ready: bool,

    /// Allocatable CPU in millicores.
    #[serde(default)]
    pub cpu_allocatable_millis: i64,

    /// Allocatable memory in bytes.
    #[serde(default)]
    pub memory_allocatable_bytes: i64,

    /// Maximum number of workload units the node accepts.
    #[serde(default)]
    pub pods_allocatable: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

impl NodeSnapshot {
    /// A ready, schedulable node with no capacity or taints set.
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::cluster_scoped(name, uid),
            ready: true,
            ..Default::default()
        }
    }

    /// True when new workload units may be placed on this node.
    pub fn is_schedulable(&self) -> bool {
        self.ready && !self.unschedulable
    }
}

/// Lifecycle phase of a workload unit as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadPhase::Pending => "pending",
            WorkloadPhase::Running => "running",
            WorkloadPhase::Succeeded => "succeeded",
            WorkloadPhase::Failed => "failed",
            WorkloadPhase::Unknown => "unknown",
        }
    }

    /// Parse the control plane's capitalized phase string.
    pub fn from_api(s: &str) -> Self {
        match s {
            "Pending" => WorkloadPhase::Pending,
            "Running" => WorkloadPhase::Running,
            "Succeeded" => WorkloadPhase::Succeeded,
            "Failed" => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }
}

/// Snapshot of a workload unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadUnitSnapshot {
    pub meta: ObjectMeta,

    #[serde(default)]
    pub phase: WorkloadPhase,

    /// Node the unit is bound to, once bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Scheduler responsible for placing this unit.
    #[serde(default)]
    pub scheduler_name: String,

    #[serde(default)]
    pub priority: i32,

    /// Summed CPU requests across containers, in millicores.
    #[serde(default)]
    pub cpu_request_millis: i64,

    /// Summed memory requests across containers, in bytes.
    #[serde(default)]
    pub memory_request_bytes: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

impl WorkloadUnitSnapshot {
    /// A pending, unbound workload unit.
    pub fn pending(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            meta: ObjectMeta::namespaced(namespace, name, uid),
            ..Default::default()
        }
    }

    /// Namespace, falling back to `default` for objects that omit it.
    pub fn namespace(&self) -> &str {
        self.meta.namespace.as_deref().unwrap_or("default")
    }

    /// True while the unit still waits for a node.
    pub fn awaiting_binding(&self) -> bool {
        self.phase == WorkloadPhase::Pending && self.node_name.is_none()
    }
}

/// Common view over node and workload-unit snapshots.
pub trait Snapshot: Clone + Send + Sync + 'static {
    /// The resource kind.
    fn kind() -> ResourceKind;

    /// Object metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Key under which the latest snapshot is mirrored.
    fn identity(&self) -> String;

    fn uid(&self) -> &str {
        &self.meta().uid
    }
}

impl Snapshot for NodeSnapshot {
    fn kind() -> ResourceKind {
        ResourceKind::Node
    }

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn identity(&self) -> String {
        self.meta.name.clone()
    }
}

impl Snapshot for WorkloadUnitSnapshot {
    fn kind() -> ResourceKind {
        ResourceKind::WorkloadUnit
    }

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn identity(&self) -> String {
        if self.meta.name.is_empty() {
            return String::new();
        }
        workload_unit_identity(self.namespace(), &self.meta.name)
    }
}

/// Identity of a workload unit: `namespace/name`.
pub fn workload_unit_identity(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
