//! The replicated key-value store.
//!
//! [`CrdtStore`] ties the pieces together:
//! - foreground writes stage operations in a pending [`Delta`] and
//!   materialize them right away, so a replica reads its own writes
//! - [`CrdtStore::publish`] turns the pending delta into a DAG node linked to
//!   the current heads, merges it and announces the new head
//! - background tasks receive peers' announcements, fetch the missing part
//!   of the DAG and merge it in causal order, and periodically re-announce
//!   heads that were not announced recently
//!
//! Datastore layout under the store namespace:
//! - `s/k/<key>` materialized entries and `s/t/<key>` tombstones
//! - `s/p/<key>` provisional tombstones of unpublished local deletes
//! - `h/<cid>` heads with their priority
//! - `b/<cid>` nodes whose delta has been merged

use crate::datastore::{Batch, Datastore};
use crate::delta::Delta;
use crate::error::{Result, StoreError};
use crate::heads::CrdtHeads;
use crate::key::Key;
use crate::options::CrdtOptions;
use crate::set::{CrdtSet, SetChange};
use cairn_merkle::{
    Announcement, Broadcaster, Cid, DagNode, DagSyncer, HeadsMessage, NodeBuilder, SyncError,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Writes staged by the batched API, committed by [`CrdtStore::commit_batch`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    batch: Batch,
    changes: Vec<SetChange>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    fn record(&mut self, changes: Vec<SetChange>) {
        for change in changes {
            let key = match &change {
                SetChange::Put(key, _) | SetChange::Delete(key) => key.clone(),
            };
            self.changes.retain(|c| !matches!(c, SetChange::Put(k, _) if *k == key));
            self.changes.push(change);
        }
    }

    /// Forget a put staged in this batch. Returns whether there was one.
    fn cancel_put(&mut self, key: &Key) -> bool {
        let before = self.changes.len();
        self.changes
            .retain(|c| !matches!(c, SetChange::Put(k, _) if k == key));
        self.changes.len() != before
    }
}

struct Workers {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// State shared by the store handle and its background tasks.
struct Inner {
    namespace: Key,
    processed: Key,
    datastore: Arc<dyn Datastore>,
    dag: Arc<dyn DagSyncer>,
    broadcaster: Arc<dyn Broadcaster>,
    options: CrdtOptions,
    set: CrdtSet,
    heads: CrdtHeads,
    pending: Mutex<Delta>,
    seen: RwLock<HashMap<Cid, Instant>>,
    /// Serializes read-modify-write cycles on the set.
    write_lock: Mutex<()>,
    /// Serializes merges so the frontier moves one node at a time.
    merge_guard: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// A replica of the Merkle-CRDT key-value store.
pub struct CrdtStore {
    inner: Arc<Inner>,
    workers: Mutex<Option<Workers>>,
}

impl CrdtStore {
    /// Open the store under `namespace` and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        datastore: Arc<dyn Datastore>,
        namespace: Key,
        dag: Arc<dyn DagSyncer>,
        broadcaster: Arc<dyn Broadcaster>,
        options: CrdtOptions,
    ) -> Result<Self> {
        let inbound = broadcaster.subscribe()?;
        let set = CrdtSet::new(datastore.clone(), &namespace.child("s"));
        let heads = CrdtHeads::load(datastore.clone(), namespace.child("h"))?;
        // The pending delta does not survive a restart, so neither do the
        // deletes it held.
        let dropped = set.clear_provisional()?;
        if dropped > 0 {
            warn!(dropped, "dropping unpublished deletes from a previous run");
        }

        info!(
            namespace = %namespace,
            heads = heads.len(),
            max_priority = heads.max_priority(),
            "opening CRDT store"
        );

        let inner = Arc::new(Inner {
            processed: namespace.child("b"),
            namespace,
            datastore,
            dag,
            broadcaster,
            set,
            heads,
            pending: Mutex::new(Delta::new()),
            seen: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            merge_guard: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            options,
        });

        let (stop, stop_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(inner.options.inbound_buffer.max(1));
        let handles = vec![
            tokio::spawn(receive_loop(inbound, queue_tx, stop_rx.clone())),
            tokio::spawn(merge_loop(inner.clone(), queue_rx, stop_rx.clone())),
            tokio::spawn(rebroadcast_loop(inner.clone(), stop_rx)),
        ];

        Ok(CrdtStore {
            inner,
            workers: Mutex::new(Some(Workers { stop, handles })),
        })
    }

    pub fn options(&self) -> &CrdtOptions {
        &self.inner.options
    }

    /// The value stored under `key`.
    pub fn get(&self, key: &Key) -> Result<Vec<u8>> {
        self.inner
            .set
            .element(key)?
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    pub fn has(&self, key: &Key) -> Result<bool> {
        self.inner.set.in_set(key)
    }

    /// Visible entries equal to or below `prefix`, in key order.
    pub fn query(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        self.inner.set.elements(prefix)
    }

    /// Write `value` under `key`. Visible locally at once, replicated on the
    /// next [`CrdtStore::publish`].
    pub fn put(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let changes = {
            let _write = inner.write_lock.lock();
            let mut batch = Batch::new();
            let changes = inner
                .set
                .put_local(&mut batch, key, &value, inner.next_priority()?)?;
            inner.datastore.commit(batch)?;
            changes
        };
        inner.pending.lock().add(key.as_str(), value);
        inner.run_hooks(changes);
        Ok(())
    }

    /// Remove `key`. Removing a key that is not visible does nothing.
    pub fn delete(&self, key: &Key) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let changes = {
            let _write = inner.write_lock.lock();
            if !inner.set.in_set(key)? {
                return Ok(());
            }
            let mut batch = Batch::new();
            let changes = inner
                .set
                .remove_local(&mut batch, key, inner.next_priority()?)?;
            inner.datastore.commit(batch)?;
            changes
        };
        inner.pending.lock().remove(key.as_str());
        inner.run_hooks(changes);
        Ok(())
    }

    /// Stage an addition without materializing it. Returns the number of
    /// pending operations.
    pub fn add_to_delta(&self, key: &Key, value: Vec<u8>) -> Result<usize> {
        self.inner.ensure_open()?;
        Ok(self.inner.pending.lock().add(key.as_str(), value))
    }

    /// Stage a removal without touching the materialized state.
    pub fn remove_from_delta(&self, key: &Key) -> Result<usize> {
        self.inner.ensure_open()?;
        Ok(self.inner.pending.lock().remove(key.as_str()))
    }

    pub fn get_batch(&self) -> WriteBatch {
        WriteBatch::default()
    }

    /// Like [`CrdtStore::put`], with the materialized write going into
    /// `batch`. Publishes early once the pending delta grows past
    /// `max_batch_delta_size`.
    pub async fn put_batch(&self, batch: &mut WriteBatch, key: &Key, value: Vec<u8>) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let changes =
            inner
                .set
                .put_local(&mut batch.batch, key, &value, inner.next_priority()?)?;
        batch.record(changes);
        let size = {
            let mut pending = inner.pending.lock();
            pending.add(key.as_str(), value);
            pending.size()
        };
        self.maybe_publish_early(batch, size).await
    }

    pub async fn delete_batch(&self, batch: &mut WriteBatch, key: &Key) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;

        if !batch.cancel_put(key) && !inner.set.in_set(key)? {
            return Ok(());
        }
        let changes =
            inner
                .set
                .remove_local(&mut batch.batch, key, inner.next_priority()?)?;
        batch.record(changes);
        let size = {
            let mut pending = inner.pending.lock();
            pending.remove(key.as_str());
            pending.size()
        };
        self.maybe_publish_early(batch, size).await
    }

    /// Commit the batch atomically, then publish.
    pub async fn commit_batch(&self, batch: WriteBatch) -> Result<Option<Cid>> {
        self.inner.ensure_open()?;
        self.inner.commit_writes(batch)?;
        self.inner.publish().await
    }

    async fn maybe_publish_early(&self, batch: &mut WriteBatch, size: usize) -> Result<()> {
        if size <= self.inner.options.max_batch_delta_size {
            return Ok(());
        }
        debug!(size, "pending delta over limit, publishing early");
        // The provisional writes must land before the published node is
        // merged, or they would overwrite it.
        self.inner.commit_writes(std::mem::take(batch))?;
        self.inner.publish().await?;
        Ok(())
    }

    /// Publish the pending delta. Returns the new head, or `None` when
    /// nothing was pending.
    pub async fn publish(&self) -> Result<Option<Cid>> {
        self.inner.ensure_open()?;
        self.inner.publish().await
    }

    /// Fetch and merge the DAG ending at `cid`. Returns the number of nodes
    /// merged; nothing is merged if any ancestor cannot be fetched.
    pub async fn resolve(&self, cid: Cid) -> Result<usize> {
        self.inner.ensure_open()?;
        self.inner.resolve(cid).await
    }

    /// Announce heads that were not announced within `seen_heads_ttl`.
    /// Returns how many were announced.
    pub async fn rebroadcast(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        self.inner.rebroadcast().await
    }

    /// Flush everything the store keeps below `prefix`.
    pub fn sync(&self, prefix: &Key) -> Result<()> {
        let inner = &self.inner;
        inner.datastore.sync(&inner.namespace.child("s").child("k").join(prefix))?;
        inner.datastore.sync(&inner.namespace.child("s").child("t").join(prefix))?;
        inner.datastore.sync(&inner.namespace.child("s").child("p").join(prefix))?;
        inner.datastore.sync(&inner.namespace.child("h"))?;
        inner.datastore.sync(&inner.processed)?;
        Ok(())
    }

    /// Current heads and their priorities, sorted by CID.
    pub fn heads(&self) -> Vec<(Cid, u64)> {
        self.inner.heads.list()
    }

    /// Heads announced within `seen_heads_ttl`, sorted.
    pub fn seen_heads(&self) -> Vec<Cid> {
        let ttl = self.inner.options.seen_heads_ttl;
        let mut seen: Vec<Cid> = self
            .inner
            .seen
            .read()
            .iter()
            .filter(|(_, at)| at.elapsed() < ttl)
            .map(|(cid, _)| *cid)
            .collect();
        seen.sort();
        seen
    }

    /// Number of operations waiting for the next publish.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Render the DAG reachable from the heads, one node per line, indented
    /// by depth. Nodes reachable through several paths are shown once.
    pub async fn print_dag(&self) -> Result<String> {
        let inner = &self.inner;
        let mut out = String::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(Cid, usize)> =
            inner.heads.list().into_iter().rev().map(|(cid, _)| (cid, 0)).collect();

        while let Some((cid, depth)) = stack.pop() {
            let indent = "  ".repeat(depth);
            if !visited.insert(cid) {
                let _ = writeln!(out, "{}- {} ...", indent, cid.short());
                continue;
            }
            let node = inner.dag.get_node(&cid).await?;
            let delta = Delta::decode(&node.delta)?;
            let _ = writeln!(
                out,
                "{}- {} priority={} adds={} removes={}",
                indent,
                cid.short(),
                node.priority,
                delta.elements.len(),
                delta.tombstones.len()
            );
            for link in node.links.iter().rev() {
                stack.push((*link, depth + 1));
            }
        }
        Ok(out)
    }

    /// Stop the background tasks and wait for them. Afterwards writes,
    /// publishes and merges fail with [`StoreError::Closed`].
    ///
    /// This is the only way to join the tasks. Dropping the store signals
    /// them, but a merge already in progress runs to completion in the
    /// background.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            let _ = workers.stop.send(true);
            for handle in workers.handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "background task failed");
                }
            }
        }

        let pending = self.pending();
        if pending > 0 {
            warn!(pending, "closing with unpublished operations");
        }
        self.inner.datastore.sync(&self.inner.namespace)?;
        info!(namespace = %self.inner.namespace, "CRDT store closed");
        Ok(())
    }
}

impl Drop for CrdtStore {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(workers) = self.workers.lock().take() {
            let _ = workers.stop.send(true);
        }
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Priority for the next local write or node, one above every head.
    fn next_priority(&self) -> Result<u64> {
        let max = self.heads.max_priority();
        max.checked_add(1)
            .filter(|p| *p < u64::MAX)
            .ok_or(StoreError::PriorityOverflow(max))
    }

    fn processed_key(&self, cid: &Cid) -> Key {
        self.processed.child(cid.to_hex())
    }

    fn is_processed(&self, cid: &Cid) -> Result<bool> {
        Ok(self.datastore.has(&self.processed_key(cid))?)
    }

    fn run_hooks(&self, changes: Vec<SetChange>) {
        for change in changes {
            match change {
                SetChange::Put(key, value) => {
                    if let Some(hook) = &self.options.put_hook {
                        hook(&key, &value);
                    }
                }
                SetChange::Delete(key) => {
                    if let Some(hook) = &self.options.delete_hook {
                        hook(&key);
                    }
                }
            }
        }
    }

    fn commit_writes(&self, batch: WriteBatch) -> Result<()> {
        let WriteBatch { batch, changes } = batch;
        if !batch.is_empty() {
            let _write = self.write_lock.lock();
            self.datastore.commit(batch)?;
        }
        self.run_hooks(changes);
        Ok(())
    }

    async fn publish(&self) -> Result<Option<Cid>> {
        let delta = std::mem::take(&mut *self.pending.lock());
        if delta.is_empty() {
            return Ok(None);
        }

        match self.publish_delta(delta.clone()).await {
            Ok(cid) => Ok(Some(cid)),
            Err(e) => {
                // Keep the operations for the next attempt, behind anything
                // staged since.
                let mut pending = self.pending.lock();
                let restored = Delta::merge(&delta, &pending);
                *pending = restored;
                Err(e)
            }
        }
    }

    async fn publish_delta(&self, mut delta: Delta) -> Result<Cid> {
        let node = {
            let _guard = self.merge_guard.lock().await;

            let links: Vec<Cid> = self.heads.list().into_iter().map(|(cid, _)| cid).collect();
            delta.priority = self.next_priority()?;
            let node = NodeBuilder::new()
                .with_links(links)
                .with_priority(delta.priority)
                .with_delta(delta.encode()?)
                .build();

            self.dag.add_node(node.clone()).await?;
            self.merge_node(&node, &delta, true)?;
            node
        };

        debug!(
            cid = %node.cid.short(),
            priority = node.priority,
            operations = delta.len(),
            "published delta"
        );

        match self.broadcaster.broadcast(vec![node.cid]).await {
            Ok(()) => {
                self.seen.write().insert(node.cid, Instant::now());
            }
            Err(e) => {
                warn!(cid = %node.cid.short(), error = %e, "broadcast failed, leaving it to the rebroadcaster");
            }
        }
        Ok(node.cid)
    }

    async fn resolve(&self, cid: Cid) -> Result<usize> {
        if self.is_processed(&cid)? {
            trace!(cid = %cid.short(), "already merged");
            return Ok(0);
        }

        let nodes = self.fetch_missing(cid).await?;

        let _guard = self.merge_guard.lock().await;
        let mut merged = 0;
        for (node, delta) in &nodes {
            if self.is_processed(&node.cid)? {
                continue;
            }
            self.merge_node(node, delta, false)?;
            merged += 1;
        }
        debug!(cid = %cid.short(), merged, "resolved head");
        Ok(merged)
    }

    /// Collect every unmerged node reachable from `cid`, ancestors first.
    async fn fetch_missing(&self, cid: Cid) -> Result<Vec<(DagNode, Delta)>> {
        let mut ordered = Vec::new();
        let mut fetched: HashMap<Cid, (DagNode, Delta)> = HashMap::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(cid, false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                if let Some(entry) = fetched.remove(&current) {
                    ordered.push(entry);
                }
                continue;
            }
            if !visited.insert(current) || self.is_processed(&current)? {
                continue;
            }

            let node = self.fetch_node(&current).await?;
            if node.priority == u64::MAX {
                return Err(StoreError::PriorityOverflow(node.priority));
            }
            let mut delta = Delta::decode(&node.delta)?;
            delta.priority = node.priority;

            stack.push((current, true));
            for link in node.links.iter().rev() {
                if !visited.contains(link) {
                    stack.push((*link, false));
                }
            }
            fetched.insert(current, (node, delta));
        }

        Ok(ordered)
    }

    async fn fetch_node(&self, cid: &Cid) -> Result<DagNode> {
        let node = timeout(self.options.fetch_timeout, self.dag.get_node(cid))
            .await
            .map_err(|_| SyncError::Timeout(*cid))??;
        Ok(node)
    }

    /// Apply one node: set changes, processed marker and head update land in
    /// a single datastore batch. `own` marks a node this replica published.
    fn merge_node(&self, node: &DagNode, delta: &Delta, own: bool) -> Result<()> {
        for link in &node.links {
            if !self.is_processed(link)? {
                return Err(StoreError::MissingNode {
                    node: node.cid,
                    link: *link,
                });
            }
        }

        let changes = {
            let _write = self.write_lock.lock();
            let mut batch = Batch::new();
            let changes = if own {
                self.set.apply_published(&mut batch, delta, &node.cid)?
            } else {
                self.set.apply(&mut batch, delta, &node.cid)?
            };
            batch.put(self.processed_key(&node.cid), node.priority.to_be_bytes().to_vec());
            let update = self
                .heads
                .stage_merged(&mut batch, node.cid, &node.links, node.priority);
            self.datastore.commit(batch)?;
            self.heads.apply(update);
            changes
        };

        trace!(cid = %node.cid.short(), changes = changes.len(), "merged node");
        self.run_hooks(changes);
        Ok(())
    }

    async fn handle_head(&self, cid: Cid) {
        match self.resolve(cid).await {
            Ok(_) => {
                self.seen.write().insert(cid, Instant::now());
            }
            Err(e) if e.is_transient() => {
                debug!(cid = %cid.short(), error = %e, "cannot fetch head yet, waiting for a rebroadcast");
            }
            Err(e) => {
                warn!(cid = %cid.short(), error = %e, "dropping head");
            }
        }
    }

    async fn rebroadcast(&self) -> Result<usize> {
        let heads = self.heads.list();
        let now = Instant::now();
        let ttl = self.options.seen_heads_ttl;

        let stale: Vec<Cid> = {
            let mut seen = self.seen.write();
            seen.retain(|_, at| now.duration_since(*at) < ttl);
            heads
                .into_iter()
                .map(|(cid, _)| cid)
                .filter(|cid| !seen.contains_key(cid))
                .collect()
        };
        if stale.is_empty() {
            return Ok(0);
        }

        self.broadcaster.broadcast(stale.clone()).await?;
        debug!(heads = stale.len(), "rebroadcast heads");

        let mut seen = self.seen.write();
        for cid in &stale {
            seen.insert(*cid, now);
        }
        Ok(stale.len())
    }
}

/// Decode announcements and queue their heads for merging.
async fn receive_loop(
    mut inbound: mpsc::Receiver<Announcement>,
    queue: mpsc::Sender<Vec<Cid>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let announcement = tokio::select! {
            _ = stop.changed() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let heads = match HeadsMessage::decode(&announcement.data) {
            Ok(message) => message.heads,
            Err(e) => {
                warn!(from = %announcement.from, topic = %announcement.topic, error = %e, "dropping malformed announcement");
                continue;
            }
        };
        trace!(from = %announcement.from, heads = heads.len(), "received heads");

        tokio::select! {
            _ = stop.changed() => break,
            sent = queue.send(heads) => if sent.is_err() { break },
        }
    }
    debug!("receive loop stopped");
}

async fn merge_loop(
    inner: Arc<Inner>,
    mut queue: mpsc::Receiver<Vec<Cid>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let heads = tokio::select! {
            _ = stop.changed() => break,
            heads = queue.recv() => match heads {
                Some(heads) => heads,
                None => break,
            },
        };

        for cid in heads {
            if *stop.borrow() {
                break;
            }
            inner.handle_head(cid).await;
        }
    }
    debug!("merge loop stopped");
}

async fn rebroadcast_loop(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(inner.options.rebroadcast_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.rebroadcast().await {
                    warn!(error = %e, "rebroadcast failed");
                }
            }
        }
    }
    debug!("rebroadcast loop stopped");
}
