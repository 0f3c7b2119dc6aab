//! Error types for event construction.

use thiserror::Error;

/// Errors that can occur when building events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The snapshot has no name, so it cannot be keyed.
    #[error("{kind} snapshot has an empty identity")]
    EmptyIdentity { kind: &'static str },

    /// A watch fault cannot be turned into a lifecycle event.
    #[error("watch fault for {kind} carries no snapshot: {message}")]
    NoSnapshot { kind: &'static str, message: String },

    /// A stored action label that names no known action.
    #[error("unknown action: {0}")]
    UnknownAction(String),
}
