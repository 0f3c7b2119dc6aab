//! Raw watch callbacks and the canonical lifecycle events built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::snapshot::{NodeSnapshot, ResourceKind, Snapshot, WorkloadUnitSnapshot};

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Added,
    Updated,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Added => "added",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(Action::Added),
            "updated" => Ok(Action::Updated),
            "deleted" => Ok(Action::Deleted),
            other => Err(EventError::UnknownAction(other.to_string())),
        }
    }
}

/// A control-plane-signaled fault on a watch stream. Carries no snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchFault {
    pub kind: ResourceKind,

    /// Status code reported with the fault, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,

    pub message: String,
}

impl std::fmt::Display for WatchFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} watch fault ({}): {}", self.kind, code, self.message),
            None => write!(f, "{} watch fault: {}", self.kind, self.message),
        }
    }
}

/// A raw callback delivered by a watch, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<S> {
    Added(S),
    Modified(S),
    Deleted(S),
    Error(WatchFault),
}

impl<S: Snapshot> WatchEvent<S> {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Error(_) => "error",
        }
    }

    /// The snapshot carried by this callback, if any.
    pub fn snapshot(&self) -> Option<&S> {
        match self {
            WatchEvent::Added(s) | WatchEvent::Modified(s) | WatchEvent::Deleted(s) => Some(s),
            WatchEvent::Error(_) => None,
        }
    }

    /// Normalize into a lifecycle event. `Modified` becomes `Updated`.
    pub fn into_lifecycle(self) -> Result<LifecycleEvent<S>, EventError> {
        match self {
            WatchEvent::Added(s) => LifecycleEvent::new(Action::Added, s),
            WatchEvent::Modified(s) => LifecycleEvent::new(Action::Updated, s),
            WatchEvent::Deleted(s) => LifecycleEvent::new(Action::Deleted, s),
            WatchEvent::Error(fault) => Err(EventError::NoSnapshot {
                kind: fault.kind.as_str(),
                message: fault.message,
            }),
        }
    }
}

/// A normalized lifecycle event for one resource.
///
/// The snapshot's identity is never empty; construction rejects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent<S> {
    action: Action,
    snapshot: S,
    observed_at: DateTime<Utc>,
}

/// Lifecycle event for an execution node.
pub type NodeEvent = LifecycleEvent<NodeSnapshot>;

/// Lifecycle event for a workload unit.
pub type WorkloadUnitEvent = LifecycleEvent<WorkloadUnitSnapshot>;

impl<S: Snapshot> LifecycleEvent<S> {
    /// Build an event observed now.
    pub fn new(action: Action, snapshot: S) -> Result<Self, EventError> {
        Self::observed(action, snapshot, Utc::now())
    }

    /// Build an event with an explicit observation time.
    pub fn observed(
        action: Action,
        snapshot: S,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        if snapshot.meta().name.trim().is_empty() || snapshot.identity().is_empty() {
            return Err(EventError::EmptyIdentity {
                kind: S::kind().as_str(),
            });
        }

        Ok(Self {
            action,
            snapshot,
            observed_at,
        })
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn snapshot(&self) -> &S {
        &self.snapshot
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn identity(&self) -> String {
        self.snapshot.identity()
    }

    pub fn kind(&self) -> ResourceKind {
        S::kind()
    }

    pub fn into_snapshot(self) -> S {
        self.snapshot
    }
}
