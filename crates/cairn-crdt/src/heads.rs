//! The causal frontier.
//!
//! Each head is persisted as `<namespace>/<cid hex>` holding its priority as
//! a big-endian u64, and mirrored in an in-memory cache. Writes are staged
//! into a datastore batch first; the cache is only touched once the batch
//! has been committed, so it never gets ahead of what is persisted.

use crate::datastore::{Batch, Datastore, DatastoreError};
use crate::error::Result;
use crate::key::Key;
use crate::set::decode_priority;
use cairn_merkle::Cid;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Staged change to the frontier, applied to the cache after commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadUpdate {
    pub added: (Cid, u64),
    pub removed: Vec<Cid>,
}

pub struct CrdtHeads {
    namespace: Key,
    cache: RwLock<HashMap<Cid, u64>>,
}

impl CrdtHeads {
    /// Read the persisted frontier under `namespace`.
    pub fn load(datastore: Arc<dyn Datastore>, namespace: Key) -> Result<Self> {
        let mut cache = HashMap::new();
        for (path, bytes) in datastore.query(&namespace)? {
            let cid = Cid::from_hex(path.name()).ok_or_else(|| DatastoreError::Corrupt {
                key: path.clone(),
                reason: "head name is not a CID".to_string(),
            })?;
            cache.insert(cid, decode_priority(&path, &bytes)?);
        }

        Ok(CrdtHeads {
            namespace,
            cache: RwLock::new(cache),
        })
    }

    fn head_key(&self, cid: &Cid) -> Key {
        self.namespace.child(cid.to_hex())
    }

    pub fn is_head(&self, cid: &Cid) -> bool {
        self.cache.read().contains_key(cid)
    }

    pub fn priority(&self, cid: &Cid) -> Option<u64> {
        self.cache.read().get(cid).copied()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Heads sorted by CID.
    pub fn list(&self) -> Vec<(Cid, u64)> {
        let mut heads: Vec<(Cid, u64)> = self.cache.read().iter().map(|(c, p)| (*c, *p)).collect();
        heads.sort();
        heads
    }

    /// Highest head priority, 0 for an empty frontier.
    pub fn max_priority(&self) -> u64 {
        self.cache.read().values().copied().max().unwrap_or(0)
    }

    /// Record a merged node: it becomes a head and every link that was a
    /// head stops being one. The writes are staged into `batch`; call
    /// [`CrdtHeads::apply`] once that batch is committed.
    pub fn stage_merged(
        &self,
        batch: &mut Batch,
        cid: Cid,
        links: &[Cid],
        priority: u64,
    ) -> HeadUpdate {
        let removed: Vec<Cid> = {
            let cache = self.cache.read();
            links.iter().filter(|l| cache.contains_key(l)).copied().collect()
        };
        let update = HeadUpdate {
            added: (cid, priority),
            removed,
        };
        self.stage(batch, &update);
        update
    }

    pub fn apply(&self, update: HeadUpdate) {
        let mut cache = self.cache.write();
        for cid in &update.removed {
            cache.remove(cid);
        }
        let (cid, priority) = update.added;
        cache.insert(cid, priority);
    }

    fn stage(&self, batch: &mut Batch, update: &HeadUpdate) {
        for cid in &update.removed {
            batch.delete(self.head_key(cid));
        }
        let (cid, priority) = update.added;
        batch.put(self.head_key(&cid), priority.to_be_bytes().to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::error::StoreError;
    use cairn_merkle::Hasher;

    fn heads() -> (Arc<MemoryDatastore>, CrdtHeads) {
        let ds = Arc::new(MemoryDatastore::new());
        let heads = CrdtHeads::load(ds.clone(), Key::new("/crdt/h")).unwrap();
        (ds, heads)
    }

    fn merge(
        ds: &MemoryDatastore,
        heads: &CrdtHeads,
        cid: Cid,
        links: &[Cid],
        priority: u64,
    ) -> Result<()> {
        let mut batch = Batch::new();
        let update = heads.stage_merged(&mut batch, cid, links, priority);
        ds.commit(batch)?;
        heads.apply(update);
        Ok(())
    }

    #[test]
    fn test_merged_node_replaces_its_links() {
        let (ds, heads) = heads();
        let a = Hasher::hash(b"a");
        let b = Hasher::hash(b"b");
        let c = Hasher::hash(b"c");
        merge(&ds, &heads, a, &[], 1).unwrap();
        merge(&ds, &heads, b, &[], 1).unwrap();

        let update = {
            let mut batch = Batch::new();
            let update = heads.stage_merged(&mut batch, c, &[a, Hasher::hash(b"gone")], 2);
            ds.commit(batch).unwrap();
            update
        };
        assert_eq!(update.removed, vec![a]);
        heads.apply(update);

        assert!(!heads.is_head(&a));
        assert!(heads.is_head(&b));
        assert_eq!(heads.priority(&c), Some(2));
        assert_eq!(heads.max_priority(), 2);
        assert_eq!(heads.len(), 2);
    }

    #[test]
    fn test_reload_from_datastore() {
        let (ds, heads) = heads();
        let a = Hasher::hash(b"a");
        let b = Hasher::hash(b"b");
        merge(&ds, &heads, a, &[], 3).unwrap();
        merge(&ds, &heads, b, &[a], 4).unwrap();

        let reloaded = CrdtHeads::load(ds, Key::new("/crdt/h")).unwrap();
        assert_eq!(reloaded.list(), vec![(b, 4)]);
    }

    #[test]
    fn test_failed_commit_leaves_cache_alone() {
        let (ds, heads) = heads();
        ds.set_read_only(true);

        let err = merge(&ds, &heads, Hasher::hash(b"a"), &[], 1).unwrap_err();
        assert_eq!(err, StoreError::Datastore(DatastoreError::ReadOnly));
        assert!(heads.is_empty());
    }

    #[test]
    fn test_corrupt_head_entry() {
        let ds = Arc::new(MemoryDatastore::new());
        ds.put(&Key::new("/crdt/h/nothex"), 1u64.to_be_bytes().to_vec())
            .unwrap();

        assert!(matches!(
            CrdtHeads::load(ds, Key::new("/crdt/h")),
            Err(StoreError::Datastore(DatastoreError::Corrupt { .. }))
        ));
    }

    #[test]
    fn test_list_sorted() {
        let (ds, heads) = heads();
        let mut cids: Vec<Cid> = (0..5u8).map(|i| Hasher::hash(&[i])).collect();
        for cid in &cids {
            merge(&ds, &heads, *cid, &[], 1).unwrap();
        }
        cids.sort();
        let listed: Vec<Cid> = heads.list().into_iter().map(|(c, _)| c).collect();
        assert_eq!(listed, cids);
    }
}
