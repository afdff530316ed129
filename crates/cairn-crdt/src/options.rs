//! Store configuration.

use crate::key::Key;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Called after a key becomes visible or changes value.
pub type PutHook = Arc<dyn Fn(&Key, &[u8]) + Send + Sync>;

/// Called after a key stops being visible.
pub type DeleteHook = Arc<dyn Fn(&Key) + Send + Sync>;

/// Configuration for a [`CrdtStore`](crate::CrdtStore).
#[derive(Clone)]
pub struct CrdtOptions {
    /// How often heads that were not announced recently are re-announced.
    pub rebroadcast_interval: Duration,
    /// How long an announced head is considered known to peers.
    pub seen_heads_ttl: Duration,
    /// Upper bound for fetching one DAG node from the network.
    pub fetch_timeout: Duration,
    /// Pending delta size (bytes) at which batched writes publish early.
    pub max_batch_delta_size: usize,
    /// Announcements buffered between the broadcaster and the merge worker.
    pub inbound_buffer: usize,
    pub put_hook: Option<PutHook>,
    pub delete_hook: Option<DeleteHook>,
}

impl Default for CrdtOptions {
    fn default() -> Self {
        Self {
            rebroadcast_interval: Duration::from_secs(5),
            seen_heads_ttl: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            max_batch_delta_size: 1024 * 1024,
            inbound_buffer: 128,
            put_hook: None,
            delete_hook: None,
        }
    }
}

impl fmt::Debug for CrdtOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrdtOptions")
            .field("rebroadcast_interval", &self.rebroadcast_interval)
            .field("seen_heads_ttl", &self.seen_heads_ttl)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("max_batch_delta_size", &self.max_batch_delta_size)
            .field("inbound_buffer", &self.inbound_buffer)
            .field("put_hook", &self.put_hook.is_some())
            .field("delete_hook", &self.delete_hook.is_some())
            .finish()
    }
}

/// Builder for store configuration.
pub struct CrdtOptionsBuilder {
    options: CrdtOptions,
}

impl CrdtOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: CrdtOptions::default(),
        }
    }

    pub fn rebroadcast_interval(mut self, interval: Duration) -> Self {
        self.options.rebroadcast_interval = interval;
        self
    }

    pub fn seen_heads_ttl(mut self, ttl: Duration) -> Self {
        self.options.seen_heads_ttl = ttl;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.options.fetch_timeout = timeout;
        self
    }

    pub fn max_batch_delta_size(mut self, bytes: usize) -> Self {
        self.options.max_batch_delta_size = bytes;
        self
    }

    pub fn inbound_buffer(mut self, size: usize) -> Self {
        self.options.inbound_buffer = size.max(1);
        self
    }

    pub fn put_hook(mut self, hook: impl Fn(&Key, &[u8]) + Send + Sync + 'static) -> Self {
        self.options.put_hook = Some(Arc::new(hook));
        self
    }

    pub fn delete_hook(mut self, hook: impl Fn(&Key) + Send + Sync + 'static) -> Self {
        self.options.delete_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> CrdtOptions {
        self.options
    }
}

impl Default for CrdtOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
