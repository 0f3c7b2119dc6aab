//! # kbind-events
//!
//! Resource snapshots, lifecycle events, and assignment records shared by the
//! kbind bridge and anything that consumes its handoff queue.
//!
//! ## Design Principles
//!
//! - Snapshots are immutable point-in-time views; a newer snapshot supersedes
//!   an older one, nothing is mutated in place
//! - Every lifecycle event carries a snapshot with a non-empty identity
//! - `Deleted` events carry the last-known snapshot, not a tombstone
//! - Assignment decisions name the workload unit by uid as well as by name
//!
//! ## Identity
//!
//! - Execution nodes are cluster-scoped: identity is the node name
//! - Workload units are namespaced: identity is `namespace/name`

mod assignment;
mod error;
mod lifecycle;
mod snapshot;

pub use assignment::*;
pub use error::EventError;
pub use lifecycle::*;
pub use snapshot::*;
