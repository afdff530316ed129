//! DAG syncer: content-addressed block exchange between replicas.
//!
//! The [`DagSyncer`] trait is what the CRDT layer consumes. It combines a
//! local node store with a pull-based exchange:
//! 1. Look the CID up locally
//! 2. On a miss, ask the swarm for the block
//! 3. Decode and verify the bytes before storing them
//!
//! [`SwarmDagSyncer`] implements it over an in-process [`BlockSwarm`].

use crate::cid::Cid;
use crate::error::SyncError;
use crate::node::DagNode;
use crate::peer::PeerId;
use crate::store::{MemoryNodeStore, NodeStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Network-facing side of the DAG.
#[async_trait]
pub trait DagSyncer: Send + Sync + 'static {
    /// Get a node, fetching it from the network if it is not stored locally.
    async fn get_node(&self, cid: &Cid) -> Result<DagNode, SyncError>;

    /// Store a locally created node and make it available to peers.
    async fn add_node(&self, node: DagNode) -> Result<(), SyncError>;

    /// Whether the block is stored locally. Never touches the network.
    async fn has_block(&self, cid: &Cid) -> Result<bool, SyncError>;

    /// Fetch `cid` and its ancestors breadth-first, `depth` levels deep
    /// (`None` for the whole graph). Returns the nodes visited.
    async fn fetch_graph(&self, cid: &Cid, depth: Option<usize>)
        -> Result<Vec<DagNode>, SyncError>;

    /// Pull a block from one specific peer.
    async fn request_node(&self, peer: &PeerId, cid: &Cid) -> Result<DagNode, SyncError>;
}

/// Configuration for the in-process block swarm.
#[derive(Clone, Debug)]
pub struct SwarmConfig {
    /// Simulated transfer latency per block.
    pub latency: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        SwarmConfig {
            latency: Duration::ZERO,
        }
    }
}

struct SwarmPeer {
    store: Arc<MemoryNodeStore>,
    reachable: bool,
}

/// Shared registry of peers' block stores.
///
/// Stands in for a bitswap/graphsync network: a want for a CID is served by
/// any reachable peer that holds the block.
pub struct BlockSwarm {
    config: SwarmConfig,
    peers: RwLock<HashMap<PeerId, SwarmPeer>>,
    transfers: AtomicUsize,
}

impl BlockSwarm {
    pub fn new(config: SwarmConfig) -> Arc<Self> {
        Arc::new(BlockSwarm {
            config,
            peers: RwLock::new(HashMap::new()),
            transfers: AtomicUsize::new(0),
        })
    }

    fn register(&self, peer: PeerId, store: Arc<MemoryNodeStore>) {
        self.peers.write().insert(
            peer,
            SwarmPeer {
                store,
                reachable: true,
            },
        );
    }

    /// Mark a peer reachable or unreachable.
    pub fn set_reachable(&self, peer: &PeerId, reachable: bool) {
        if let Some(p) = self.peers.write().get_mut(peer) {
            p.reachable = reachable;
        }
    }

    pub fn is_reachable(&self, peer: &PeerId) -> bool {
        self.peers.read().get(peer).is_some_and(|p| p.reachable)
    }

    /// Number of blocks moved between peers so far.
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Ask every reachable peer except `requester` for a block.
    async fn want(&self, requester: &PeerId, cid: &Cid) -> Result<Vec<u8>, SyncError> {
        let (candidates, unreachable_holder) = {
            let peers = self.peers.read();
            let mut candidates = Vec::new();
            let mut unreachable_holder = None;
            for (id, peer) in peers.iter() {
                if id == requester || !peer.store.has(cid) {
                    continue;
                }
                if peer.reachable {
                    candidates.push(peer.store.clone());
                } else {
                    unreachable_holder = Some(id.clone());
                }
            }
            (candidates, unreachable_holder)
        };

        self.transfer_delay().await;
        for store in candidates {
            if let Some(bytes) = store.get_block(cid) {
                self.transfers.fetch_add(1, Ordering::Relaxed);
                return Ok(bytes);
            }
        }

        match unreachable_holder {
            Some(peer) => Err(SyncError::PeerUnreachable(peer)),
            None => Err(SyncError::NotFound(*cid)),
        }
    }

    /// Pull a block from one peer.
    async fn pull(&self, peer: &PeerId, cid: &Cid) -> Result<Vec<u8>, SyncError> {
        let store = {
            let peers = self.peers.read();
            match peers.get(peer) {
                Some(p) if p.reachable => p.store.clone(),
                _ => return Err(SyncError::PeerUnreachable(peer.clone())),
            }
        };

        self.transfer_delay().await;
        let bytes = store.get_block(cid).ok_or(SyncError::NotFound(*cid))?;
        self.transfers.fetch_add(1, Ordering::Relaxed);
        Ok(bytes)
    }

    async fn transfer_delay(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }
}

/// [`DagSyncer`] backed by a local [`MemoryNodeStore`] and a [`BlockSwarm`].
pub struct SwarmDagSyncer {
    peer_id: PeerId,
    store: Arc<MemoryNodeStore>,
    swarm: Arc<BlockSwarm>,
    started: AtomicBool,
}

impl SwarmDagSyncer {
    /// Create a syncer and join the swarm.
    pub fn join(peer_id: PeerId, swarm: Arc<BlockSwarm>) -> Arc<Self> {
        let store = Arc::new(MemoryNodeStore::new());
        swarm.register(peer_id.clone(), store.clone());
        Arc::new(SwarmDagSyncer {
            peer_id,
            store,
            swarm,
            started: AtomicBool::new(true),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The local node store.
    pub fn store(&self) -> &Arc<MemoryNodeStore> {
        &self.store
    }

    /// Rejoin the exchange after [`SwarmDagSyncer::stop`].
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.swarm.set_reachable(&self.peer_id, true);
    }

    /// Leave the exchange: stop serving and fetching blocks.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.swarm.set_reachable(&self.peer_id, false);
    }

    fn ensure_started(&self) -> Result<(), SyncError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Stopped)
        }
    }

    /// Handle a block delivered by the exchange.
    ///
    /// Blocks already stored are ignored; malformed bytes are rejected.
    pub fn block_received(&self, cid: &Cid, bytes: &[u8]) -> Result<DagNode, SyncError> {
        if let Some(node) = self.store.get(cid) {
            trace!(cid = %cid.short(), "duplicate block ignored");
            return Ok(node);
        }

        let node = DagNode::from_bytes(bytes).inspect_err(|e| {
            warn!(cid = %cid.short(), error = %e, "cannot create node from received block");
        })?;
        if node.cid != *cid {
            return Err(SyncError::VerificationFailed(*cid));
        }

        self.store.put(node.clone())?;
        Ok(node)
    }
}

#[async_trait]
impl DagSyncer for SwarmDagSyncer {
    async fn get_node(&self, cid: &Cid) -> Result<DagNode, SyncError> {
        if let Some(node) = self.store.get(cid) {
            return Ok(node);
        }

        self.ensure_started()?;
        debug!(peer = %self.peer_id, cid = %cid.short(), "fetching block from swarm");
        let bytes = self.swarm.want(&self.peer_id, cid).await?;
        self.block_received(cid, &bytes)
    }

    async fn add_node(&self, node: DagNode) -> Result<(), SyncError> {
        self.store.put(node)?;
        Ok(())
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool, SyncError> {
        Ok(self.store.has(cid))
    }

    async fn fetch_graph(
        &self,
        cid: &Cid,
        depth: Option<usize>,
    ) -> Result<Vec<DagNode>, SyncError> {
        let mut fetched = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(*cid, 0usize)]);

        while let Some((current, level)) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }

            let node = self.get_node(&current).await?;
            if depth.map_or(true, |max| level < max) {
                for link in &node.links {
                    if !visited.contains(link) {
                        queue.push_back((*link, level + 1));
                    }
                }
            }
            fetched.push(node);
        }

        Ok(fetched)
    }

    async fn request_node(&self, peer: &PeerId, cid: &Cid) -> Result<DagNode, SyncError> {
        self.ensure_started()?;
        let bytes = self.swarm.pull(peer, cid).await?;
        self.block_received(cid, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeBuilder;

    fn chain(syncer: &SwarmDagSyncer, len: u64) -> Vec<Cid> {
        let mut cids: Vec<Cid> = Vec::new();
        for i in 1..=len {
            let node = NodeBuilder::new()
                .with_links(cids.last().copied().into_iter().collect())
                .with_priority(i)
                .with_delta(vec![i as u8])
                .build();
            cids.push(syncer.store().put(node).unwrap());
        }
        cids
    }

    #[tokio::test]
    async fn test_get_node_from_swarm() {
        let swarm = BlockSwarm::new(SwarmConfig::default());
        let a = SwarmDagSyncer::join(PeerId::new("a"), swarm.clone());
        let b = SwarmDagSyncer::join(PeerId::new("b"), swarm.clone());

        let cids = chain(&a, 1);
        assert!(!b.has_block(&cids[0]).await.unwrap());

        let node = b.get_node(&cids[0]).await.unwrap();
        assert_eq!(node.cid, cids[0]);
        assert!(b.has_block(&cids[0]).await.unwrap());
        assert_eq!(swarm.transfers(), 1);

        // Second read is local.
        b.get_node(&cids[0]).await.unwrap();
        assert_eq!(swarm.transfers(), 1);
    }

    #[tokio::test]
    async fn test_missing_block() {
        let swarm = BlockSwarm::new(SwarmConfig::default());
        let a = SwarmDagSyncer::join(PeerId::new("a"), swarm);
        let cid = crate::cid::Hasher::hash(b"nowhere");

        assert_eq!(a.get_node(&cid).await, Err(SyncError::NotFound(cid)));
    }

    #[tokio::test]
    async fn test_unreachable_holder() {
        let swarm = BlockSwarm::new(SwarmConfig::default());
        let a = SwarmDagSyncer::join(PeerId::new("a"), swarm.clone());
        let b = SwarmDagSyncer::join(PeerId::new("b"), swarm.clone());
        let cids = chain(&a, 1);

        a.stop();
        assert_eq!(
            b.get_node(&cids[0]).await,
            Err(SyncError::PeerUnreachable(PeerId::new("a")))
        );
        assert_eq!(
            b.request_node(&PeerId::new("a"), &cids[0]).await,
            Err(SyncError::PeerUnreachable(PeerId::new("a")))
        );

        a.start();
        assert!(b.request_node(&PeerId::new("a"), &cids[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_graph_depth() {
        let swarm = BlockSwarm::new(SwarmConfig::default());
        let a = SwarmDagSyncer::join(PeerId::new("a"), swarm.clone());
        let b = SwarmDagSyncer::join(PeerId::new("b"), swarm);
        let cids = chain(&a, 5);

        let partial = b.fetch_graph(&cids[4], Some(2)).await.unwrap();
        assert_eq!(partial.len(), 3);
        assert!(!b.has_block(&cids[1]).await.unwrap());

        let full = b.fetch_graph(&cids[4], None).await.unwrap();
        assert_eq!(full.len(), 5);
        assert_eq!(b.store().len(), 5);
    }

    #[test]
    fn test_block_received_rejects_garbage() {
        let swarm = BlockSwarm::new(SwarmConfig::default());
        let a = SwarmDagSyncer::join(PeerId::new("a"), swarm);
        let cid = crate::cid::Hasher::hash(b"x");

        assert!(matches!(
            a.block_received(&cid, b"\x00\x01garbage"),
            Err(SyncError::Decode(_))
        ));

        let node = NodeBuilder::new().with_priority(1).with_delta(vec![1]).build();
        let bytes = node.to_bytes().unwrap();
        assert_eq!(
            a.block_received(&cid, &bytes),
            Err(SyncError::VerificationFailed(cid))
        );
        assert!(a.store().is_empty());

        a.block_received(&node.cid, &bytes).unwrap();
        a.block_received(&node.cid, &bytes).unwrap();
        assert_eq!(a.store().len(), 1);
    }
}
