//! The delta merger: materialized key/value state plus tombstones.
//!
//! For a key, the visible value is the addition with the highest
//! `(priority, cid)` pair among all applied additions, unless a tombstone
//! with priority >= that addition's priority exists. This is a
//! join-semilattice over (max addition, max tombstone priority), so
//! applying deltas in any order, any number of times, converges.
//!
//! Layout under the set namespace:
//! - `k/<key>` encoded [`StoredEntry`]
//! - `t/<key>` tombstone priority, u64 big-endian
//! - `p/<key>` provisional tombstone of an unpublished local delete

use crate::datastore::{Batch, Datastore};
use crate::delta::Delta;
use crate::error::{Result, StoreError};
use crate::key::Key;
use cairn_merkle::Cid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A visible change to the set, reported to hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetChange {
    Put(Key, Vec<u8>),
    Delete(Key),
}

/// The winning addition for a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub priority: u64,
    /// CID of the node that carried the addition; zero while unpublished.
    pub cid: Cid,
}

impl StoredEntry {
    fn rank(&self) -> (u64, Cid) {
        (self.priority, self.cid)
    }
}

pub struct CrdtSet {
    datastore: Arc<dyn Datastore>,
    values: Key,
    tombs: Key,
    provisional: Key,
}

impl CrdtSet {
    pub fn new(datastore: Arc<dyn Datastore>, namespace: &Key) -> Self {
        CrdtSet {
            datastore,
            values: namespace.child("k"),
            tombs: namespace.child("t"),
            provisional: namespace.child("p"),
        }
    }

    fn value_key(&self, key: &Key) -> Key {
        self.values.join(key)
    }

    fn tomb_key(&self, key: &Key) -> Key {
        self.tombs.join(key)
    }

    fn provisional_key(&self, key: &Key) -> Key {
        self.provisional.join(key)
    }

    pub fn entry(&self, key: &Key) -> Result<Option<StoredEntry>> {
        let path = self.value_key(key);
        match self.datastore.get(&path)? {
            Some(bytes) => decode_entry(&path, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn tombstone(&self, key: &Key) -> Result<Option<u64>> {
        let path = self.tomb_key(key);
        match self.datastore.get(&path)? {
            Some(bytes) => decode_priority(&path, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Priority of the unpublished local delete of `key`, if any.
    pub fn provisional_tombstone(&self, key: &Key) -> Result<Option<u64>> {
        let path = self.provisional_key(key);
        match self.datastore.get(&path)? {
            Some(bytes) => decode_priority(&path, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// The visible value of a key.
    pub fn element(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(self.entry(key)?.map(|e| e.value))
    }

    pub fn in_set(&self, key: &Key) -> Result<bool> {
        Ok(self.datastore.has(&self.value_key(key))?)
    }

    /// Visible entries equal to or below `prefix`, in key order.
    pub fn elements(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        self.datastore
            .query(&self.value_key(prefix))?
            .into_iter()
            .filter_map(|(path, bytes)| {
                let key = path.strip_prefix(&self.values)?;
                Some(decode_entry(&path, &bytes).map(|e| (key, e.value)))
            })
            .collect()
    }

    /// Merge a delta carried by node `cid`, staging writes in `batch`.
    pub fn apply(&self, batch: &mut Batch, delta: &Delta, cid: &Cid) -> Result<Vec<SetChange>> {
        let mut merge = Merge::new(self);
        merge.apply(batch, delta, cid)?;
        Ok(merge.changes())
    }

    /// Merge a delta this replica published. It carries the final local
    /// intent for its keys, so their provisional tombstones are dropped
    /// first.
    pub fn apply_published(
        &self,
        batch: &mut Batch,
        delta: &Delta,
        cid: &Cid,
    ) -> Result<Vec<SetChange>> {
        let mut merge = Merge::new(self);
        for key in delta.tombstones.iter().chain(&delta.elements).map(|e| Key::new(&e.key)) {
            merge.settle(batch, &key);
        }
        merge.apply(batch, delta, cid)?;
        Ok(merge.changes())
    }

    /// Materialize an unpublished write at `priority`.
    ///
    /// The zero CID loses every tie, so the published node's entry replaces
    /// this one when the delta is merged for real. The write replaces a
    /// pending local delete of the key, so its provisional tombstone goes.
    pub fn put_local(
        &self,
        batch: &mut Batch,
        key: &Key,
        value: &[u8],
        priority: u64,
    ) -> Result<Vec<SetChange>> {
        let mut merge = Merge::new(self);
        merge.settle(batch, key);
        merge.add(batch, key, value, priority, &Cid::zero())?;
        Ok(merge.changes())
    }

    /// Hide a key until the pending tombstone is published.
    ///
    /// A provisional tombstone at `priority` keeps remote additions at or
    /// below it out until then. The published tombstone never has a lower
    /// priority. The delete is staged even when the key is not visible yet,
    /// so it also cancels a put staged earlier in the same batch.
    pub fn remove_local(
        &self,
        batch: &mut Batch,
        key: &Key,
        priority: u64,
    ) -> Result<Vec<SetChange>> {
        let mut merge = Merge::new(self);
        merge.hide(batch, key, priority)?;
        Ok(merge.changes())
    }

    /// Drop provisional tombstones of deletes that were never published.
    /// Returns how many were dropped.
    pub fn clear_provisional(&self) -> Result<usize> {
        let stale = self.datastore.query(&self.provisional)?;
        if stale.is_empty() {
            return Ok(0);
        }
        let mut batch = Batch::new();
        for (path, _) in &stale {
            batch.delete(path.clone());
        }
        self.datastore.commit(batch)?;
        Ok(stale.len())
    }
}

/// Per-delta overlay so several elements touching one key see each other.
struct Merge<'a> {
    set: &'a CrdtSet,
    entries: HashMap<Key, Option<StoredEntry>>,
    tombs: HashMap<Key, Option<u64>>,
    provisional: HashMap<Key, Option<u64>>,
    before: BTreeMap<Key, Option<Vec<u8>>>,
}

impl<'a> Merge<'a> {
    fn new(set: &'a CrdtSet) -> Self {
        Merge {
            set,
            entries: HashMap::new(),
            tombs: HashMap::new(),
            provisional: HashMap::new(),
            before: BTreeMap::new(),
        }
    }

    fn apply(&mut self, batch: &mut Batch, delta: &Delta, cid: &Cid) -> Result<()> {
        for tomb in &delta.tombstones {
            self.remove(batch, &Key::new(&tomb.key), delta.priority)?;
        }
        for element in &delta.elements {
            self.add(
                batch,
                &Key::new(&element.key),
                &element.value,
                delta.priority,
                cid,
            )?;
        }
        Ok(())
    }

    fn entry(&mut self, key: &Key) -> Result<Option<StoredEntry>> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(entry.clone());
        }
        let entry = self.set.entry(key)?;
        self.entries.insert(key.clone(), entry.clone());
        self.before
            .entry(key.clone())
            .or_insert_with(|| entry.as_ref().map(|e| e.value.clone()));
        Ok(entry)
    }

    fn tomb(&mut self, key: &Key) -> Result<Option<u64>> {
        if let Some(tomb) = self.tombs.get(key) {
            return Ok(*tomb);
        }
        let tomb = self.set.tombstone(key)?;
        self.tombs.insert(key.clone(), tomb);
        Ok(tomb)
    }

    fn provisional(&mut self, key: &Key) -> Result<Option<u64>> {
        if let Some(tomb) = self.provisional.get(key) {
            return Ok(*tomb);
        }
        let tomb = self.set.provisional_tombstone(key)?;
        self.provisional.insert(key.clone(), tomb);
        Ok(tomb)
    }

    /// Forget the provisional tombstone of `key`. Staged unconditionally,
    /// since it may only exist earlier in the same batch.
    fn settle(&mut self, batch: &mut Batch, key: &Key) {
        batch.delete(self.set.provisional_key(key));
        self.provisional.insert(key.clone(), None);
    }

    fn hide(&mut self, batch: &mut Batch, key: &Key, priority: u64) -> Result<()> {
        let priority = self.provisional(key)?.map_or(priority, |p| p.max(priority));
        batch.put(self.set.provisional_key(key), priority.to_be_bytes().to_vec());
        self.provisional.insert(key.clone(), Some(priority));
        self.entry(key)?;
        batch.delete(self.set.value_key(key));
        self.entries.insert(key.clone(), None);
        Ok(())
    }

    fn add(
        &mut self,
        batch: &mut Batch,
        key: &Key,
        value: &[u8],
        priority: u64,
        cid: &Cid,
    ) -> Result<()> {
        if self.tomb(key)?.is_some_and(|t| t >= priority)
            || self.provisional(key)?.is_some_and(|p| p >= priority)
        {
            return Ok(());
        }
        if let Some(current) = self.entry(key)? {
            // Unpublished entries yield to a local rewrite at the same rank.
            let replaceable = current.cid.is_zero() && cid.is_zero();
            if current.rank() > (priority, *cid)
                || (current.rank() == (priority, *cid) && !replaceable)
            {
                return Ok(());
            }
        }

        let entry = StoredEntry {
            value: value.to_vec(),
            priority,
            cid: *cid,
        };
        batch.put(self.set.value_key(key), encode_entry(&entry)?);
        self.entries.insert(key.clone(), Some(entry));
        Ok(())
    }

    fn remove(&mut self, batch: &mut Batch, key: &Key, priority: u64) -> Result<()> {
        if self.tomb(key)?.map_or(true, |t| priority > t) {
            batch.put(self.set.tomb_key(key), priority.to_be_bytes().to_vec());
            self.tombs.insert(key.clone(), Some(priority));
        }
        if self.entry(key)?.is_some_and(|e| e.priority <= priority) {
            batch.delete(self.set.value_key(key));
            self.entries.insert(key.clone(), None);
        }
        Ok(())
    }

    fn changes(self) -> Vec<SetChange> {
        let mut changes = Vec::new();
        for (key, before) in self.before {
            let after = self
                .entries
                .get(&key)
                .and_then(|e| e.as_ref().map(|e| e.value.clone()));
            if before == after {
                continue;
            }
            match after {
                Some(value) => changes.push(SetChange::Put(key, value)),
                None => changes.push(SetChange::Delete(key)),
            }
        }
        changes
    }
}

fn encode_entry(entry: &StoredEntry) -> Result<Vec<u8>> {
    serde_json::to_vec(entry).map_err(|e| StoreError::Encode(e.to_string()))
}

fn decode_entry(path: &Key, bytes: &[u8]) -> Result<StoredEntry> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(format!("{}: {}", path, e)))
}

pub(crate) fn decode_priority(path: &Key, bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Decode(format!("{}: bad priority length {}", path, bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use cairn_merkle::Hasher;

    fn set() -> CrdtSet {
        CrdtSet::new(Arc::new(MemoryDatastore::new()), &Key::new("/crdt/s"))
    }

    fn apply(set: &CrdtSet, delta: &Delta, cid: &Cid) -> Vec<SetChange> {
        let mut batch = Batch::new();
        let changes = set.apply(&mut batch, delta, cid).unwrap();
        set.datastore.commit(batch).unwrap();
        changes
    }

    fn put(key: &str, value: &str, priority: u64) -> Delta {
        let mut delta = Delta::new();
        delta.add(key, value.as_bytes().to_vec());
        delta.priority = priority;
        delta
    }

    fn del(key: &str, priority: u64) -> Delta {
        let mut delta = Delta::new();
        delta.remove(key);
        delta.priority = priority;
        delta
    }

    #[test]
    fn test_apply_put() {
        let set = set();
        let changes = apply(&set, &put("/a", "1", 1), &Hasher::hash(b"n1"));

        assert_eq!(changes, vec![SetChange::Put(Key::new("/a"), b"1".to_vec())]);
        assert_eq!(set.element(&Key::new("/a")).unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_idempotent() {
        let set = set();
        let cid = Hasher::hash(b"n1");
        apply(&set, &put("/a", "1", 1), &cid);
        let changes = apply(&set, &put("/a", "1", 1), &cid);

        assert!(changes.is_empty());
        assert_eq!(set.elements(&Key::root()).unwrap().len(), 1);
    }

    #[test]
    fn test_higher_priority_wins_any_order() {
        let high = (put("/a", "high", 10), Hasher::hash(b"high"));
        let low = (put("/a", "low", 7), Hasher::hash(b"low"));

        for order in [[&high, &low], [&low, &high]] {
            let set = set();
            for (delta, cid) in order {
                apply(&set, delta, cid);
            }
            assert_eq!(set.element(&Key::new("/a")).unwrap(), Some(b"high".to_vec()));
        }
    }

    #[test]
    fn test_tombstone_wins_equal_priority() {
        let add = (put("/a", "1", 5), Hasher::hash(b"add"));
        let remove = (del("/a", 5), Hasher::hash(b"remove"));

        for order in [[&add, &remove], [&remove, &add]] {
            let set = set();
            for (delta, cid) in order {
                apply(&set, delta, cid);
            }
            assert!(!set.in_set(&Key::new("/a")).unwrap());
            assert_eq!(set.tombstone(&Key::new("/a")).unwrap(), Some(5));
        }
    }

    #[test]
    fn test_put_above_tombstone_survives() {
        let set = set();
        apply(&set, &del("/a", 4), &Hasher::hash(b"d"));
        apply(&set, &put("/a", "back", 6), &Hasher::hash(b"p"));
        apply(&set, &del("/a", 3), &Hasher::hash(b"old"));

        assert_eq!(set.element(&Key::new("/a")).unwrap(), Some(b"back".to_vec()));
        assert_eq!(set.tombstone(&Key::new("/a")).unwrap(), Some(4));
    }

    #[test]
    fn test_cid_breaks_ties() {
        let c1 = Hasher::hash(b"one");
        let c2 = Hasher::hash(b"two");
        let (winner, loser) = if c1 > c2 { ("one", "two") } else { ("two", "one") };

        let set = set();
        apply(&set, &put("/a", "one", 3), &c1);
        apply(&set, &put("/a", "two", 3), &c2);
        assert_eq!(set.element(&Key::new("/a")).unwrap(), Some(winner.as_bytes().to_vec()));
        assert_ne!(winner, loser);
    }

    #[test]
    fn test_local_write_replaced_by_published() {
        let set = set();
        let key = Key::new("/a");
        let mut batch = Batch::new();
        set.put_local(&mut batch, &key, b"v", 1).unwrap();
        set.datastore.commit(batch).unwrap();
        assert_eq!(set.entry(&key).unwrap().unwrap().cid, Cid::zero());

        let cid = Hasher::hash(b"published");
        let changes = apply(&set, &put("/a", "v", 1), &cid);
        assert!(changes.is_empty());
        assert_eq!(set.entry(&key).unwrap().unwrap().cid, cid);
    }

    #[test]
    fn test_remove_local() {
        let set = set();
        let key = Key::new("/a");
        apply(&set, &put("/a", "1", 1), &Hasher::hash(b"n"));

        let mut batch = Batch::new();
        let changes = set.remove_local(&mut batch, &key, 2).unwrap();
        set.datastore.commit(batch).unwrap();

        assert_eq!(changes, vec![SetChange::Delete(key.clone())]);
        assert!(!set.in_set(&key).unwrap());
        assert_eq!(set.tombstone(&key).unwrap(), None);
        assert_eq!(set.provisional_tombstone(&key).unwrap(), Some(2));

        let mut batch = Batch::new();
        assert!(set.remove_local(&mut batch, &key, 2).unwrap().is_empty());
    }

    #[test]
    fn test_local_delete_holds_off_older_remote_put() {
        let set = set();
        let key = Key::new("/k");
        apply(&set, &put("/k", "new", 3), &Hasher::hash(b"n1"));

        let mut batch = Batch::new();
        set.remove_local(&mut batch, &key, 4).unwrap();
        set.datastore.commit(batch).unwrap();

        assert!(apply(&set, &put("/k", "old", 2), &Hasher::hash(b"n0")).is_empty());
        assert!(apply(&set, &put("/k", "same", 4), &Hasher::hash(b"n2")).is_empty());
        assert_eq!(set.element(&key).unwrap(), None);

        let changes = apply(&set, &put("/k", "later", 5), &Hasher::hash(b"n3"));
        assert_eq!(changes, vec![SetChange::Put(key.clone(), b"later".to_vec())]);
    }

    #[test]
    fn test_local_put_replaces_local_delete() {
        let set = set();
        let key = Key::new("/a");
        apply(&set, &put("/a", "1", 1), &Hasher::hash(b"n"));

        let mut batch = Batch::new();
        set.remove_local(&mut batch, &key, 2).unwrap();
        set.put_local(&mut batch, &key, b"2", 2).unwrap();
        set.datastore.commit(batch).unwrap();

        assert_eq!(set.element(&key).unwrap(), Some(b"2".to_vec()));
        assert_eq!(set.provisional_tombstone(&key).unwrap(), None);
    }

    #[test]
    fn test_published_delta_settles_local_delete() {
        let set = set();
        let key = Key::new("/a");
        let mut batch = Batch::new();
        set.remove_local(&mut batch, &key, 1).unwrap();
        set.datastore.commit(batch).unwrap();

        let mut published = Delta::new();
        published.add("/a", b"v".to_vec());
        published.priority = 1;
        let mut batch = Batch::new();
        set.apply_published(&mut batch, &published, &Hasher::hash(b"own"))
            .unwrap();
        set.datastore.commit(batch).unwrap();

        assert_eq!(set.element(&key).unwrap(), Some(b"v".to_vec()));
        assert_eq!(set.provisional_tombstone(&key).unwrap(), None);
    }

    #[test]
    fn test_clear_provisional() {
        let set = set();
        let mut batch = Batch::new();
        set.remove_local(&mut batch, &Key::new("/a"), 1).unwrap();
        set.remove_local(&mut batch, &Key::new("/b/c"), 1).unwrap();
        set.datastore.commit(batch).unwrap();

        assert_eq!(set.clear_provisional().unwrap(), 2);
        assert_eq!(set.clear_provisional().unwrap(), 0);
        apply(&set, &put("/a", "1", 1), &Hasher::hash(b"n"));
        assert!(set.in_set(&Key::new("/a")).unwrap());
    }

    #[test]
    fn test_local_rewrite_before_publish() {
        let set = set();
        let key = Key::new("/a");
        for value in [b"1", b"2"] {
            let mut batch = Batch::new();
            set.put_local(&mut batch, &key, value, 1).unwrap();
            set.datastore.commit(batch).unwrap();
        }
        assert_eq!(set.element(&key).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_elements_prefix() {
        let set = set();
        let mut delta = Delta::new();
        delta.add("/tasks/1", b"a".to_vec());
        delta.add("/tasks/2", b"b".to_vec());
        delta.add("/other", b"c".to_vec());
        delta.priority = 1;
        apply(&set, &delta, &Hasher::hash(b"n"));

        let tasks = set.elements(&Key::new("/tasks")).unwrap();
        assert_eq!(
            tasks,
            vec![
                (Key::new("/tasks/1"), b"a".to_vec()),
                (Key::new("/tasks/2"), b"b".to_vec()),
            ]
        );
    }

    #[test]
    fn test_same_key_added_and_removed_in_one_delta() {
        let set = set();
        let merged = Delta::merge(&put("/a", "1", 2), &del("/a", 2));
        let changes = apply(&set, &merged, &Hasher::hash(b"m"));

        assert!(changes.is_empty());
        assert!(!set.in_set(&Key::new("/a")).unwrap());
    }
}
