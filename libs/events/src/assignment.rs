//! Assignment decisions and the outcome of actuating them.

use serde::{Deserialize, Serialize};

use crate::snapshot::workload_unit_identity;

/// A computed {workload unit, node} pairing to be actuated.
///
/// `workload_unit_uid` pins the decision to one incarnation of the unit: a
/// unit re-created under the same name has a different uid and must not
/// receive a binding meant for its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentDecision {
    pub namespace: String,
    pub workload_unit_name: String,
    pub workload_unit_uid: String,
    pub node_name: String,
}

impl AssignmentDecision {
    pub fn new(
        namespace: impl Into<String>,
        workload_unit_name: impl Into<String>,
        workload_unit_uid: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            workload_unit_name: workload_unit_name.into(),
            workload_unit_uid: workload_unit_uid.into(),
            node_name: node_name.into(),
        }
    }

    /// Identity of the targeted workload unit.
    pub fn identity(&self) -> String {
        workload_unit_identity(&self.namespace, &self.workload_unit_name)
    }
}

/// Terminal result of actuating one decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingOutcome {
    pub decision: AssignmentDecision,

    /// Binding calls issued for this decision.
    pub attempts: u32,

    pub success: bool,

    /// Wall time from the first call's start to the last call's return.
    pub latency_nanos: u64,

    /// Error from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BindingOutcome {
    pub fn latency(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.latency_nanos)
    }
}
