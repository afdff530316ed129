//! # cairn-crdt
//!
//! A replicated key-value store whose replicas converge by exchanging
//! Merkle-DAG deltas.
//!
//! Every publish turns the locally staged writes into an immutable,
//! content-addressed node linked to the replica's current heads. Peers learn
//! about new heads through the broadcaster, fetch the nodes they are missing
//! through the DAG syncer and merge them in causal order. Conflicting writes
//! to a key resolve by priority (causal height), then by CID, so every
//! replica picks the same winner whatever order deltas arrive in.
//!
//! ## Example
//!
//! ```rust
//! use cairn_crdt::{CrdtOptions, CrdtStore, Key, MemoryDatastore};
//! use cairn_merkle::{
//!     BlockSwarm, BroadcastConfig, PeerId, PubSubBroadcaster, PubSubHub, SwarmConfig,
//!     SwarmDagSyncer,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> cairn_crdt::Result<()> {
//! let hub = PubSubHub::new();
//! let swarm = BlockSwarm::new(SwarmConfig::default());
//! let peer = PeerId::new("replica_0");
//!
//! let store = CrdtStore::new(
//!     Arc::new(MemoryDatastore::new()),
//!     Key::new("/crdt"),
//!     SwarmDagSyncer::join(peer.clone(), swarm),
//!     PubSubBroadcaster::join(hub, "tasks", peer, BroadcastConfig::default()),
//!     CrdtOptions::default(),
//! )?;
//!
//! store.put(&Key::new("/tasks/1"), b"queued".to_vec())?;
//! assert_eq!(store.get(&Key::new("/tasks/1"))?, b"queued".to_vec());
//!
//! let head = store.publish().await?;
//! assert!(head.is_some());
//! store.close().await
//! # }
//! ```

pub mod datastore;
pub mod delta;
pub mod error;
pub mod heads;
pub mod key;
pub mod options;
pub mod set;
pub mod store;

pub use datastore::{Batch, BatchOp, Datastore, DatastoreError, MemoryDatastore};
pub use delta::{Delta, Element};
pub use error::{Result, StoreError};
pub use heads::{CrdtHeads, HeadUpdate};
pub use key::Key;
pub use options::{CrdtOptions, CrdtOptionsBuilder, DeleteHook, PutHook};
pub use set::{CrdtSet, SetChange, StoredEntry};
pub use store::{CrdtStore, WriteBatch};
