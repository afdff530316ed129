//! Error types for the CRDT store.

use crate::datastore::DatastoreError;
use crate::key::Key;
use cairn_merkle::{BroadcastError, Cid, SyncError};
use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(Key),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Encode error: {0}")]
    Encode(String),

    /// Malformed delta, entry or head record.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("DAG sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    /// A node was about to be merged before one of its links.
    #[error("Missing causal predecessor {} of {}", .link.short(), .node.short())]
    MissingNode { node: Cid, link: Cid },

    /// No priority is left above this one. `u64::MAX` is never assigned.
    #[error("No priority left above {0}")]
    PriorityOverflow(u64),

    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    /// Errors caused by the network rather than local state; the affected
    /// head is retried on the next announcement.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Sync(
                SyncError::NotFound(_)
                    | SyncError::PeerUnreachable(_)
                    | SyncError::Timeout(_)
                    | SyncError::Stopped
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
