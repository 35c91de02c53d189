// # Event Bus
//
// Typed pub/sub for cluster and store events. Local subscribers receive
// events through bounded queues; a full queue drops the event for that
// subscriber and bumps a visible drop counter. Publishers never block.
//
// A publish can be marked cluster-wide: the envelope is also handed to the
// outbound channel the node wires to the inter-node transport, and
// incoming remote envelopes are deduplicated by event id before local
// delivery.

use crate::common::{new_correlation_id, now_millis};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// How many recently seen event ids are remembered for deduplication.
const RECENT_ID_CAPACITY: usize = 1024;

/// Default queue depth for a subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterEvent {
    MemberJoined { id: String },
    MemberLeft { id: String },
    MemberFailed { id: String },
    MemberRecovered { id: String },
    TopologyChanged { ring_version: u64 },
    StoreWarning { store: String, message: String },
}

impl ClusterEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::MemberJoined { .. } => "member_joined",
            ClusterEvent::MemberLeft { .. } => "member_left",
            ClusterEvent::MemberFailed { .. } => "member_failed",
            ClusterEvent::MemberRecovered { .. } => "member_recovered",
            ClusterEvent::TopologyChanged { .. } => "topology_changed",
            ClusterEvent::StoreWarning { .. } => "store_warning",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub origin: String,
    pub timestamp_ms: u64,
    pub event: ClusterEvent,
}

struct Subscriber {
    name: String,
    sender: mpsc::Sender<EventEnvelope>,
    drops: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberStats {
    pub name: String,
    pub dropped: u64,
}

pub struct EventBus {
    origin: String,
    // Copy-on-write subscriber list: publishers clone the Arc and never
    // hold the lock while delivering.
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    recent_ids: Mutex<RecentIds>,
    outbound: Mutex<Option<mpsc::UnboundedSender<EventEnvelope>>>,
    published: AtomicU64,
    dropped_total: AtomicU64,
    duplicates_suppressed: AtomicU64,
}

struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl EventBus {
    pub fn new(origin: String) -> Self {
        Self {
            origin,
            subscribers: RwLock::new(Arc::new(Vec::new())),
            recent_ids: Mutex::new(RecentIds {
                order: VecDeque::with_capacity(RECENT_ID_CAPACITY),
                seen: HashSet::with_capacity(RECENT_ID_CAPACITY),
            }),
            outbound: Mutex::new(None),
            published: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
        }
    }

    /// Register a subscriber; events arrive on the returned receiver.
    pub fn subscribe(&self, name: &str, capacity: usize) -> mpsc::Receiver<EventEnvelope> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let mut guard = self.subscribers.write();
        let mut list: Vec<Subscriber> = guard
            .iter()
            .map(|s| Subscriber {
                name: s.name.clone(),
                sender: s.sender.clone(),
                drops: s.drops.clone(),
            })
            .collect();
        list.push(Subscriber {
            name: name.to_string(),
            sender,
            drops: Arc::new(AtomicU64::new(0)),
        });
        *guard = Arc::new(list);
        receiver
    }

    /// Hand the bus a channel to the transport fan-out task. Cluster-wide
    /// publishes flow through it.
    pub fn set_outbound(&self, sender: mpsc::UnboundedSender<EventEnvelope>) {
        *self.outbound.lock() = Some(sender);
    }

    /// Deliver locally only.
    pub fn publish(&self, event: ClusterEvent) -> EventEnvelope {
        let envelope = self.envelope(event);
        self.remember(&envelope.id);
        self.deliver_local(&envelope);
        envelope
    }

    /// Deliver locally and forward to peers through the outbound channel.
    pub fn publish_cluster(&self, event: ClusterEvent) -> EventEnvelope {
        let envelope = self.publish(event);
        if let Some(outbound) = self.outbound.lock().as_ref() {
            let _ = outbound.send(envelope.clone());
        }
        envelope
    }

    /// Accept an envelope forwarded by a peer. Returns false when the id
    /// was already seen and the event was suppressed.
    pub fn ingest_remote(&self, envelope: EventEnvelope) -> bool {
        if !self.remember(&envelope.id) {
            self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        debug!(
            event = envelope.event.kind(),
            origin = %envelope.origin,
            "remote event accepted"
        );
        self.deliver_local(&envelope);
        true
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates_suppressed.load(Ordering::Relaxed)
    }

    pub fn subscriber_stats(&self) -> Vec<SubscriberStats> {
        self.subscribers
            .read()
            .iter()
            .map(|s| SubscriberStats {
                name: s.name.clone(),
                dropped: s.drops.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn envelope(&self, event: ClusterEvent) -> EventEnvelope {
        EventEnvelope {
            id: new_correlation_id(),
            origin: self.origin.clone(),
            timestamp_ms: now_millis(),
            event,
        }
    }

    fn deliver_local(&self, envelope: &EventEnvelope) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers.iter() {
            // try_send keeps the publisher non-blocking; a slow subscriber
            // loses events, never stalls the bus.
            if subscriber.sender.try_send(envelope.clone()).is_err() {
                subscriber.drops.fetch_add(1, Ordering::Relaxed);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record an event id. Returns false when it was already known.
    fn remember(&self, id: &str) -> bool {
        let mut recent = self.recent_ids.lock();
        if recent.seen.contains(id) {
            return false;
        }
        if recent.order.len() == RECENT_ID_CAPACITY {
            if let Some(evicted) = recent.order.pop_front() {
                recent.seen.remove(&evicted);
            }
        }
        recent.order.push_back(id.to_string());
        recent.seen.insert(id.to_string());
        true
    }
}
