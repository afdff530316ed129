//! Error types for the DAG layer.

use crate::cid::Cid;
use crate::peer::PeerId;
use thiserror::Error;

/// Errors from the local node store.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum NodeStoreError {
    #[error("Node not found: {}", .0.short())]
    NotFound(Cid),

    #[error("Verification failed for: {}", .0.short())]
    VerificationFailed(Cid),
}

/// Errors from the DAG syncer and block exchange.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// No reachable peer holds the block.
    #[error("Block not found: {}", .0.short())]
    NotFound(Cid),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    #[error("Fetch timed out: {}", .0.short())]
    Timeout(Cid),

    /// Block bytes could not be decoded.
    #[error("Malformed block: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    /// Block decoded but its CID does not match its contents.
    #[error("Verification failed: {}", .0.short())]
    VerificationFailed(Cid),

    /// The local syncer has left the swarm.
    #[error("Syncer stopped")]
    Stopped,

    #[error("Node store error: {0}")]
    Store(#[from] NodeStoreError),
}

/// Errors from head broadcasting.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Malformed announcement: {0}")]
    Decode(String),

    #[error("Inbound channel already taken")]
    AlreadySubscribed,

    #[error("Broadcaster closed")]
    Closed,
}
