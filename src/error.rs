use std::fmt;

use crate::types::TaskId;

/// Errors surfaced to callers of the queue's admission interface.
///
/// These are the only failures the engine ever propagates: delivery
/// failures and retry exhaustion are internal state transitions, never
/// errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A task with this id is already present in the backlog or a
    /// dispatch slot. Caller must pick a new id.
    DuplicateId { id: TaskId },

    /// The backlog is full. No state was changed.
    CapacityExceeded { capacity: usize },

    /// The id is not in the backlog. Tasks already occupying a
    /// dispatch slot are not cancellable and also report this.
    NotFound { id: TaskId },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::DuplicateId { id } => {
                write!(f, "a task has already been queued with id {id}")
            }
            QueueError::CapacityExceeded { capacity } => {
                write!(f, "queue has reached capacity ({capacity})")
            }
            QueueError::NotFound { id } => {
                write!(f, "no queued task with id {id}")
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors from the ordered task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The store is at its configured capacity.
    CapacityExceeded,

    /// An entry with this id already exists.
    DuplicateId,

    /// The store holds no entries.
    Empty,

    /// No entry with this id exists.
    NotFound,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::CapacityExceeded => write!(f, "store has reached capacity"),
            StoreError::DuplicateId => write!(f, "store ids must be unique"),
            StoreError::Empty => write!(f, "store is empty"),
            StoreError::NotFound => write!(f, "no entry with that id"),
        }
    }
}

impl std::error::Error for StoreError {}
