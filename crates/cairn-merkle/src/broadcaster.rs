//! Pub/sub broadcasting for head dissemination.
//!
//! The Broadcaster announces new DAG heads to every replica subscribed to
//! the same topic, triggering the pull-based sync through the DAG syncer.
//! Delivery is best effort: a full or closed inbound channel drops the
//! announcement, and the periodic rebroadcast heals the loss.

use crate::cid::Cid;
use crate::error::BroadcastError;
use crate::peer::PeerId;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Configuration for the broadcaster.
#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Capacity of the bounded inbound channel.
    pub channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            channel_capacity: 256,
        }
    }
}

/// Wire format of a head announcement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadsMessage {
    pub heads: Vec<Cid>,
}

impl HeadsMessage {
    pub fn new(heads: Vec<Cid>) -> Self {
        HeadsMessage { heads }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BroadcastError> {
        serde_json::to_vec(self).map_err(|e| BroadcastError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, BroadcastError> {
        serde_json::from_slice(data).map_err(|e| BroadcastError::Decode(e.to_string()))
    }
}

/// An inbound delivery: raw announcement bytes plus where they came from.
#[derive(Clone, Debug)]
pub struct Announcement {
    pub data: Vec<u8>,
    pub topic: String,
    pub from: PeerId,
}

/// Disseminates the local head list and delivers peers' announcements.
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    /// Announce heads to the group.
    async fn broadcast(&self, heads: Vec<Cid>) -> Result<(), BroadcastError>;

    /// Take the inbound channel. Can be called once.
    fn subscribe(&self) -> Result<mpsc::Receiver<Announcement>, BroadcastError>;
}

struct Subscriber {
    tx: mpsc::Sender<Announcement>,
    partitioned: bool,
}

/// In-process pub/sub hub shared by all replicas of a test or demo.
#[derive(Default)]
pub struct PubSubHub {
    topics: RwLock<HashMap<String, HashMap<PeerId, Subscriber>>>,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
}

impl PubSubHub {
    pub fn new() -> Arc<Self> {
        Arc::new(PubSubHub::default())
    }

    fn register(&self, topic: &str, peer: PeerId, tx: mpsc::Sender<Announcement>) {
        self.topics.write().entry(topic.to_string()).or_default().insert(
            peer,
            Subscriber {
                tx,
                partitioned: false,
            },
        );
    }

    /// Cut a peer off from the topic (both directions) or reconnect it.
    pub fn set_partitioned(&self, peer: &PeerId, partitioned: bool) {
        for subscribers in self.topics.write().values_mut() {
            if let Some(sub) = subscribers.get_mut(peer) {
                sub.partitioned = partitioned;
            }
        }
    }

    /// Deliver raw bytes from `from` to every other reachable subscriber.
    pub fn publish_raw(&self, topic: &str, from: &PeerId, data: Vec<u8>) {
        let targets: Vec<(PeerId, mpsc::Sender<Announcement>)> = {
            let topics = self.topics.read();
            let Some(subscribers) = topics.get(topic) else {
                return;
            };
            if subscribers.get(from).is_some_and(|s| s.partitioned) {
                self.dropped.fetch_add(subscribers.len().saturating_sub(1), Ordering::Relaxed);
                return;
            }
            subscribers
                .iter()
                .filter(|(id, sub)| *id != from && !sub.partitioned)
                .map(|(id, sub)| (id.clone(), sub.tx.clone()))
                .collect()
        };

        for (peer, tx) in targets {
            let announcement = Announcement {
                data: data.clone(),
                topic: topic.to_string(),
                from: from.clone(),
            };
            match tx.try_send(announcement) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(%peer, topic, "inbound channel full, announcement dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, topic, "subscriber gone");
                }
            }
        }
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// [`Broadcaster`] over a [`PubSubHub`] topic.
pub struct PubSubBroadcaster {
    peer_id: PeerId,
    topic: String,
    hub: Arc<PubSubHub>,
    inbound: Mutex<Option<mpsc::Receiver<Announcement>>>,
    sent: AtomicUsize,
}

impl PubSubBroadcaster {
    /// Subscribe `peer_id` to `topic` on the hub.
    pub fn join(
        hub: Arc<PubSubHub>,
        topic: impl Into<String>,
        peer_id: PeerId,
        config: BroadcastConfig,
    ) -> Arc<Self> {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        hub.register(&topic, peer_id.clone(), tx);
        Arc::new(PubSubBroadcaster {
            peer_id,
            topic,
            hub,
            inbound: Mutex::new(Some(rx)),
            sent: AtomicUsize::new(0),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of announcements sent by this replica.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broadcaster for PubSubBroadcaster {
    async fn broadcast(&self, heads: Vec<Cid>) -> Result<(), BroadcastError> {
        let data = HeadsMessage::new(heads).encode()?;
        self.hub.publish_raw(&self.topic, &self.peer_id, data);
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<Announcement>, BroadcastError> {
        self.inbound.lock().take().ok_or(BroadcastError::AlreadySubscribed)
    }
}
