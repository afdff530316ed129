//! DAG node definition and builder.
//!
//! Each node in the Merkle-DAG contains:
//! - A content identifier (CID) computed from its contents
//! - Links to the nodes that were the writer's heads when it was created
//! - A priority: the causal height of the node
//! - An opaque delta payload produced by the CRDT layer

use crate::cid::{Cid, Hasher};
use crate::error::SyncError;
use serde::{Deserialize, Serialize};

/// An immutable, content-addressed node in the Merkle-DAG.
///
/// Changing any field changes the CID, so a node received from a peer is
/// checked with [`DagNode::verify`] before it is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNode {
    /// SHA-256 of the node's canonical encoding.
    pub cid: Cid,

    /// Causal predecessors, sorted and deduplicated. Empty for a first write.
    pub links: Vec<Cid>,

    /// Causal height: one more than the highest priority among the links.
    pub priority: u64,

    /// Encoded delta carried by this node.
    pub delta: Vec<u8>,
}

impl DagNode {
    /// Check whether `cid` is a direct link of this node.
    pub fn links_to(&self, cid: &Cid) -> bool {
        self.links.binary_search(cid).is_ok()
    }

    fn compute_cid(links: &[Cid], priority: u64, delta: &[u8]) -> Cid {
        let mut hasher = Hasher::new();

        hasher.update(&(links.len() as u64).to_le_bytes());
        for link in links {
            hasher.update(link.as_bytes());
        }

        hasher.update(&priority.to_le_bytes());

        hasher.update(&(delta.len() as u64).to_le_bytes());
        hasher.update(delta);

        hasher.finalize()
    }

    /// Verify that the CID matches the node's contents.
    pub fn verify(&self) -> bool {
        let mut sorted = self.links.clone();
        sorted.sort();
        sorted.dedup();
        sorted == self.links && Self::compute_cid(&self.links, self.priority, &self.delta) == self.cid
    }

    /// Encode the node as a block for the node store and the block exchange.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(|e| SyncError::Encode(e.to_string()))
    }

    /// Decode a block, rejecting bytes whose CID does not match their contents.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let node: DagNode =
            serde_json::from_slice(bytes).map_err(|e| SyncError::Decode(e.to_string()))?;
        if !node.verify() {
            return Err(SyncError::VerificationFailed(node.cid));
        }
        Ok(node)
    }
}

/// Builder for creating DAG nodes.
#[derive(Clone, Debug, Default)]
pub struct NodeBuilder {
    links: Vec<Cid>,
    priority: u64,
    delta: Vec<u8>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        NodeBuilder::default()
    }

    /// Set the links (the writer's current heads).
    pub fn with_links(mut self, links: Vec<Cid>) -> Self {
        self.links = links;
        self
    }

    /// Add a single link.
    pub fn with_link(mut self, link: Cid) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the encoded delta payload.
    pub fn with_delta(mut self, delta: Vec<u8>) -> Self {
        self.delta = delta;
        self
    }

    /// Build the node, computing its CID.
    pub fn build(mut self) -> DagNode {
        self.links.sort();
        self.links.dedup();
        let cid = DagNode::compute_cid(&self.links, self.priority, &self.delta);

        DagNode {
            cid,
            links: self.links,
            priority: self.priority,
            delta: self.delta,
        }
    }
}
