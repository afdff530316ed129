//! # cairn-merkle
//!
//! Merkle-DAG substrate for the Cairn replicated key-value store.
//!
//! This crate provides:
//! - Content identifiers and content-addressed DAG nodes
//! - A node store mapping CIDs to immutable nodes
//! - The DAG syncer: block exchange used to fetch missing ancestors
//! - The broadcaster: pub/sub dissemination of head CIDs
//!
//! ## Example
//!
//! ```rust
//! use cairn_merkle::{MemoryNodeStore, NodeBuilder, NodeStore};
//!
//! let store = MemoryNodeStore::new();
//!
//! let first = NodeBuilder::new()
//!     .with_priority(1)
//!     .with_delta(b"delta".to_vec())
//!     .build();
//! let first_cid = store.put(first).unwrap();
//!
//! // A later write links to the writer's heads at the time.
//! let second = NodeBuilder::new()
//!     .with_link(first_cid)
//!     .with_priority(2)
//!     .with_delta(b"another delta".to_vec())
//!     .build();
//! let second_cid = store.put(second).unwrap();
//!
//! assert!(store.ancestors(&second_cid).contains(&first_cid));
//! ```

mod broadcaster;
mod cid;
mod error;
mod node;
mod peer;
mod store;
mod syncer;

pub use broadcaster::{
    Announcement, BroadcastConfig, Broadcaster, HeadsMessage, PubSubBroadcaster, PubSubHub,
};
pub use cid::{Cid, Hasher};
pub use error::{BroadcastError, NodeStoreError, SyncError};
pub use node::{DagNode, NodeBuilder};
pub use peer::PeerId;
pub use store::{MemoryNodeStore, NodeStore};
pub use syncer::{BlockSwarm, DagSyncer, SwarmConfig, SwarmDagSyncer};
