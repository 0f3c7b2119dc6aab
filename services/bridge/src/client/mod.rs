//! Cluster resource client capability.
//!
//! The bridge never talks to the control plane directly; it goes through the
//! [`ClusterClient`] trait, which provides:
//! - A resync-driven watch over execution nodes
//! - An event-driven watch over workload units
//! - The binding call that records a unit's node assignment
//!
//! Watch streams own their reconnection: a transient stream fault surfaces as a
//! [`WatchEvent::Error`] and the adapter resumes on its own backoff schedule.
//!
//! Two adapters ship here: [`ApiServerClient`] for a live cluster and
//! [`EmulatedCluster`] for tests and local replay.

mod apiserver;
mod emulated;

pub use apiserver::{ApiServerClient, ApiServerConfig};
pub use emulated::{EmulatedCluster, RecordedBinding};

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use kbind_events::{AssignmentDecision, NodeSnapshot, WatchEvent, WorkloadUnitSnapshot};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{interval_at, Instant, Interval};

/// A watch: an endless stream of raw callbacks. Ends only when the adapter
/// gives up or is dropped.
pub type WatchStream<S> = Pin<Box<dyn Stream<Item = WatchEvent<S>> + Send + 'static>>;

/// Shortest node resync period a watch will tick at.
pub const MIN_RESYNC: Duration = Duration::from_millis(100);

/// Resync ticker whose first tick fires one period from now. Periods below
/// [`MIN_RESYNC`] are raised to it.
pub(crate) fn resync_interval(resync: Duration) -> Interval {
    let period = resync.max(MIN_RESYNC);
    interval_at(Instant::now() + period, period)
}

/// Errors returned by a single control-plane API call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The control plane rejected the call.
    #[error("api status {code}: {message}")]
    Status { code: u16, message: String },

    /// The target object changed identity or is already bound.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The target object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call did not return within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The request never got a response.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors establishing a watch or building a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("failed to establish {kind} watch: {source}")]
    Watch {
        kind: &'static str,
        #[source]
        source: ApiError,
    },
}

/// Payload for a binding call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingRequest {
    pub namespace: String,
    pub workload_unit_name: String,

    /// Precondition: the binding applies only to the object with this uid.
    pub workload_unit_uid: String,

    pub node_name: String,
}

impl From<&AssignmentDecision> for BindingRequest {
    fn from(decision: &AssignmentDecision) -> Self {
        Self {
            namespace: decision.namespace.clone(),
            workload_unit_name: decision.workload_unit_name.clone(),
            workload_unit_uid: decision.workload_unit_uid.clone(),
            node_name: decision.node_name.clone(),
        }
    }
}

/// The live binding state of a workload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentBinding {
    pub uid: String,
    pub node_name: Option<String>,
}

/// Capability interface over the cluster control plane.
///
/// Implementations must be safe for concurrent use: the binding pool calls
/// `create_binding` from many workers at once.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Watch execution nodes. Cached nodes are re-delivered as `Modified`
    /// every `resync` so the mirror is never staler than that interval.
    async fn watch_nodes(&self, resync: Duration) -> Result<WatchStream<NodeSnapshot>, ClientError>;

    /// Watch workload units.
    async fn watch_workload_units(&self) -> Result<WatchStream<WorkloadUnitSnapshot>, ClientError>;

    /// Bind a workload unit to a node.
    async fn create_binding(&self, request: &BindingRequest) -> Result<(), ApiError>;

    /// Read the live uid and node of a workload unit. `None` if it is gone.
    async fn current_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CurrentBinding>, ApiError>;
}
