//! Content-addressed node storage.
//!
//! The node store maps a CID to an immutable [`DagNode`]. It does not track
//! heads; the frontier is owned by the CRDT layer.

use crate::cid::Cid;
use crate::error::NodeStoreError;
use crate::node::DagNode;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};

/// Trait for content-addressed node storage shared between tasks.
pub trait NodeStore: Send + Sync {
    /// Get a node by its CID.
    fn get(&self, cid: &Cid) -> Option<DagNode>;

    /// Store a node, returning its CID.
    ///
    /// The CID is verified before storage. Storing a node twice is a no-op.
    fn put(&self, node: DagNode) -> Result<Cid, NodeStoreError>;

    /// Check if a node exists in the store.
    fn has(&self, cid: &Cid) -> bool;

    /// Get the total number of nodes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory implementation of [`NodeStore`].
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<Cid, DagNode>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        MemoryNodeStore {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Get the encoded block for a CID.
    pub fn get_block(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.nodes.read().get(cid).and_then(|n| n.to_bytes().ok())
    }

    /// Get all locally known ancestors of a node (transitive closure).
    pub fn ancestors(&self, cid: &Cid) -> HashSet<Cid> {
        let nodes = self.nodes.read();
        let mut result = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(node) = nodes.get(cid) {
            queue.extend(node.links.iter().copied());
        }

        while let Some(current) = queue.pop_front() {
            if result.insert(current) {
                if let Some(node) = nodes.get(&current) {
                    queue.extend(node.links.iter().copied());
                }
            }
        }

        result
    }

    /// All CIDs in topological order (links before the nodes linking to them).
    pub fn topological_order(&self) -> Vec<Cid> {
        let nodes = self.nodes.read();
        let mut in_degree: HashMap<Cid, usize> = HashMap::new();
        let mut children: HashMap<Cid, Vec<Cid>> = HashMap::new();
        let mut result = Vec::new();
        let mut queue = VecDeque::new();

        for (cid, node) in nodes.iter() {
            let degree = node.links.iter().filter(|l| nodes.contains_key(l)).count();
            in_degree.insert(*cid, degree);
            for link in &node.links {
                children.entry(*link).or_default().push(*cid);
            }
            if degree == 0 {
                queue.push_back(*cid);
            }
        }

        // Kahn's algorithm
        while let Some(cid) = queue.pop_front() {
            result.push(cid);
            if let Some(kids) = children.get(&cid) {
                for child in kids {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(*child);
                        }
                    }
                }
            }
        }

        result
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, cid: &Cid) -> Option<DagNode> {
        self.nodes.read().get(cid).cloned()
    }

    fn put(&self, node: DagNode) -> Result<Cid, NodeStoreError> {
        if !node.verify() {
            return Err(NodeStoreError::VerificationFailed(node.cid));
        }

        let cid = node.cid;
        self.nodes.write().entry(cid).or_insert(node);
        Ok(cid)
    }

    fn has(&self, cid: &Cid) -> bool {
        self.nodes.read().contains_key(cid)
    }

    fn len(&self) -> usize {
        self.nodes.read().len()
    }
}
