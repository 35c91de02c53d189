// # Replicator
//
// Asynchronous fan-out of mutations from a key's primary to its replicas.
// Each peer gets a dedicated worker with a bounded queue; enqueueing
// applies backpressure locally but delivery never blocks the client path.
// Workers coalesce queued envelopes for the same key down to the highest
// version before sending, and retry transient failures with exponential
// backoff. Incoming envelopes are applied through the store's version gate,
// which makes delivery idempotent and order-insensitive per key.
//
// Topology changes trigger a rebalance sweep: entries this node no longer
// owns are pushed to their new primary and dropped locally once delivered.

use crate::cluster::coordinator::Coordinator;
use crate::cluster::events::{ClusterEvent, EventBus, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::common::now_millis;
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::network::transport::NodeTransport;
use crate::persistence::OpKind;
use crate::store::VersionedOp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queue depth per peer worker.
const WORKER_QUEUE_CAPACITY: usize = 1024;

/// Delivery attempts per envelope before it is dropped and counted.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// First backoff step; doubles per attempt with jitter.
const BASE_BACKOFF: Duration = Duration::from_millis(50);

/// One replicated mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    pub store: String,
    pub key: Vec<u8>,
    pub op: OpKind,
    pub value: Option<Vec<u8>>,
    pub ttl_secs: u64,
    pub version: u64,
    pub origin: String,
    pub correlation_id: String,
    pub timestamp_ms: u64,
}

impl ReplicationEnvelope {
    pub fn expires_at(&self) -> Option<u64> {
        (self.ttl_secs > 0).then(|| self.timestamp_ms + self.ttl_secs * 1000)
    }

    fn coalesce_key(&self) -> (String, Vec<u8>) {
        (self.store.clone(), self.key.clone())
    }
}

/// Apply an incoming envelope to local state. Returns false when the local
/// version was already at or past the envelope's.
pub fn apply_envelope(engine: &CacheEngine, envelope: &ReplicationEnvelope) -> Result<bool> {
    match envelope.op {
        OpKind::Set => {
            let value = envelope.value.clone().ok_or_else(|| {
                CacheError::ReplicationFailed("SET envelope missing value".into())
            })?;
            engine.apply_versioned(
                &envelope.store,
                &envelope.key,
                VersionedOp::Set {
                    value,
                    created_at: envelope.timestamp_ms,
                    expires_at: envelope.expires_at(),
                },
                envelope.version,
            )
        }
        OpKind::Del => engine.apply_versioned(
            &envelope.store,
            &envelope.key,
            VersionedOp::Delete,
            envelope.version,
        ),
        OpKind::Expire => engine.apply_expire(
            &envelope.store,
            &envelope.key,
            envelope.expires_at(),
            envelope.version,
        ),
        OpKind::Clear => {
            engine.clear(&envelope.store)?;
            Ok(true)
        }
    }
}

/// Coalesce a drained batch: for each (store, key), only the highest
/// version survives. Relative order of surviving envelopes is kept.
pub fn coalesce(batch: Vec<ReplicationEnvelope>) -> Vec<ReplicationEnvelope> {
    let mut best: HashMap<(String, Vec<u8>), u64> = HashMap::new();
    for envelope in &batch {
        let slot = best.entry(envelope.coalesce_key()).or_insert(0);
        if envelope.version > *slot {
            *slot = envelope.version;
        }
    }
    batch
        .into_iter()
        .filter(|envelope| best.get(&envelope.coalesce_key()) == Some(&envelope.version))
        .collect()
}

#[derive(Debug, Default)]
struct ReplicationCounters {
    enqueued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    coalesced_away: AtomicU64,
    applied: AtomicU64,
    dropped_stale: AtomicU64,
    rebalanced_keys: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStatsSnapshot {
    pub enqueued: u64,
    pub sent: u64,
    pub failed: u64,
    pub coalesced_away: u64,
    pub applied: u64,
    pub dropped_stale: u64,
    pub rebalanced_keys: u64,
    pub active_peers: usize,
}

pub struct Replicator {
    local_id: String,
    coordinator: Arc<Coordinator>,
    transport: Arc<NodeTransport>,
    engine: Arc<CacheEngine>,
    workers: Mutex<HashMap<String, mpsc::Sender<ReplicationEnvelope>>>,
    counters: Arc<ReplicationCounters>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Replicator {
    pub fn new(
        coordinator: Arc<Coordinator>,
        transport: Arc<NodeTransport>,
        engine: Arc<CacheEngine>,
    ) -> Self {
        Self {
            local_id: coordinator.local_id().to_string(),
            coordinator,
            transport,
            engine,
            workers: Mutex::new(HashMap::new()),
            counters: Arc::new(ReplicationCounters::default()),
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Fan a mutation out to the key's replicas. Called on the primary
    /// after the local write succeeded; never blocks on delivery.
    pub async fn replicate(&self, envelope: ReplicationEnvelope) {
        let owners = self.coordinator.owners(&envelope.key);
        for owner in owners {
            if owner == self.local_id {
                continue;
            }
            self.enqueue(&owner, envelope.clone()).await;
        }
    }

    /// Apply an envelope delivered by a peer.
    pub fn apply_incoming(&self, envelope: &ReplicationEnvelope) -> Result<bool> {
        if envelope.origin == self.local_id {
            // Our own write echoed back; nothing to do and nothing to
            // re-replicate.
            return Ok(false);
        }
        let applied = apply_envelope(&self.engine, envelope)?;
        if applied {
            self.counters.applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
        }
        Ok(applied)
    }

    /// Push entries this node no longer owns to their new primary, then
    /// drop them locally. Driven by TopologyChanged.
    pub async fn rebalance(&self) {
        let ring = self.coordinator.ring();
        if ring.len() < 2 {
            return;
        }
        let replication_factor = self.coordinator.replication_factor();
        let mut moved = 0u64;
        for (store, entries) in self.engine.dump_all() {
            for entry in entries {
                let owners = ring.owners(&entry.key, replication_factor);
                if owners.iter().any(|o| o == &self.local_id) {
                    continue;
                }
                let Some(primary) = owners.first() else {
                    continue;
                };
                let now = now_millis();
                let ttl_secs = match entry.expires_at {
                    Some(at) if at <= now => continue, // expired since the dump
                    Some(at) => (at - now).div_ceil(1000).max(1),
                    None => 0,
                };
                let envelope = ReplicationEnvelope {
                    store: store.clone(),
                    key: entry.key.clone(),
                    op: OpKind::Set,
                    value: Some(entry.value.clone()),
                    ttl_secs,
                    version: entry.version,
                    origin: self.local_id.clone(),
                    correlation_id: crate::common::new_correlation_id(),
                    timestamp_ms: now,
                };
                match self.send_direct(primary, &envelope).await {
                    Ok(()) => {
                        // Handoff complete; release the local copy.
                        if let Ok(store_ref) = self.engine.store(&store) {
                            let _ = store_ref.delete(&entry.key);
                        }
                        moved += 1;
                    }
                    Err(e) => {
                        debug!(peer = %primary, error = %e, "handoff send failed, keeping local copy");
                    }
                }
            }
        }
        if moved > 0 {
            self.counters
                .rebalanced_keys
                .fetch_add(moved, Ordering::Relaxed);
            info!(moved, "rebalance sweep moved keys to new owners");
        }
    }

    /// Start reacting to topology changes.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self
            .coordinator_bus()
            .subscribe("replicator", DEFAULT_SUBSCRIBER_CAPACITY);
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(envelope) => {
                                if matches!(envelope.event, ClusterEvent::TopologyChanged { .. }) {
                                    this.rebalance().await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.workers.lock().clear();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn stats(&self) -> ReplicationStatsSnapshot {
        ReplicationStatsSnapshot {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            coalesced_away: self.counters.coalesced_away.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            dropped_stale: self.counters.dropped_stale.load(Ordering::Relaxed),
            rebalanced_keys: self.counters.rebalanced_keys.load(Ordering::Relaxed),
            active_peers: self.workers.lock().len(),
        }
    }

    fn coordinator_bus(&self) -> Arc<EventBus> {
        self.coordinator.bus()
    }

    async fn enqueue(&self, peer: &str, envelope: ReplicationEnvelope) {
        let sender = {
            let mut workers = self.workers.lock();
            workers
                .entry(peer.to_string())
                .or_insert_with(|| self.spawn_worker(peer))
                .clone()
        };
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        // Bounded send: a saturated peer queue backpressures the enqueue,
        // never the delivery path of other peers.
        if sender.send(envelope).await.is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.workers.lock().remove(peer);
        }
    }

    fn spawn_worker(&self, peer: &str) -> mpsc::Sender<ReplicationEnvelope> {
        let (sender, mut receiver) = mpsc::channel::<ReplicationEnvelope>(WORKER_QUEUE_CAPACITY);
        let peer = peer.to_string();
        let coordinator = self.coordinator.clone();
        let transport = self.transport.clone();
        let counters = self.counters.clone();
        let mut shutdown = self.shutdown.subscribe();

        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    received = receiver.recv() => match received {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };

                // Drain whatever else queued up and collapse same-key
                // updates to the newest version.
                let mut batch = vec![first];
                while let Ok(envelope) = receiver.try_recv() {
                    batch.push(envelope);
                }
                let before = batch.len();
                let batch = coalesce(batch);
                counters
                    .coalesced_away
                    .fetch_add((before - batch.len()) as u64, Ordering::Relaxed);

                for envelope in batch {
                    let Some(member) = coordinator.member(&peer) else {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    match deliver_with_retries(&transport, &member.http_addr, &envelope).await {
                        Ok(()) => {
                            counters.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                peer = %peer,
                                correlation_id = %envelope.correlation_id,
                                error = %e,
                                "replication delivery failed"
                            );
                        }
                    }
                }
            }
        }));
        sender
    }

    async fn send_direct(&self, peer: &str, envelope: &ReplicationEnvelope) -> Result<()> {
        let member = self
            .coordinator
            .member(peer)
            .ok_or_else(|| CacheError::ReplicationFailed(format!("unknown peer {peer}")))?;
        self.transport.replicate(&member.http_addr, envelope).await
    }
}

async fn deliver_with_retries(
    transport: &NodeTransport,
    http_addr: &str,
    envelope: &ReplicationEnvelope,
) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        match transport.replicate(http_addr, envelope).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_DELIVERY_ATTEMPTS {
                    return Err(e);
                }
                let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                let jitter_ms = {
                    use rand::Rng;
                    rand::rng().random_range(0..backoff.as_millis().max(1) as u64)
                };
                tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheTuning, StoreConfig};

    fn envelope(key: &[u8], version: u64, op: OpKind, value: Option<&[u8]>) -> ReplicationEnvelope {
        ReplicationEnvelope {
            store: "default".to_string(),
            key: key.to_vec(),
            op,
            value: value.map(|v| v.to_vec()),
            ttl_secs: 0,
            version,
            origin: "n2".to_string(),
            correlation_id: "cid".to_string(),
            timestamp_ms: now_millis(),
        }
    }

    fn engine() -> Arc<CacheEngine> {
        CacheEngine::from_configs(CacheTuning::default(), &[StoreConfig::named("default")])
            .unwrap()
    }

    #[test]
    fn test_apply_is_idempotent() {
        let engine = engine();
        let env = envelope(b"k", 3, OpKind::Set, Some(b"v"));
        assert!(apply_envelope(&engine, &env).unwrap());
        assert!(!apply_envelope(&engine, &env).unwrap());
        assert_eq!(engine.get("default", b"k").unwrap().0, b"v");
    }

    #[test]
    fn test_apply_drops_out_of_order_older_versions() {
        let engine = engine();
        assert!(apply_envelope(&engine, &envelope(b"k", 7, OpKind::Set, Some(b"new"))).unwrap());
        assert!(!apply_envelope(&engine, &envelope(b"k", 4, OpKind::Set, Some(b"old"))).unwrap());
        assert_eq!(engine.get("default", b"k").unwrap().0, b"new");
    }

    #[test]
    fn test_apply_delete_respects_version_gate() {
        let engine = engine();
        apply_envelope(&engine, &envelope(b"k", 5, OpKind::Set, Some(b"v"))).unwrap();
        assert!(!apply_envelope(&engine, &envelope(b"k", 5, OpKind::Del, None)).unwrap());
        assert!(apply_envelope(&engine, &envelope(b"k", 6, OpKind::Del, None)).unwrap());
        assert!(engine.get("default", b"k").is_err());
    }

    #[test]
    fn test_coalesce_keeps_highest_version_per_key() {
        let batch = vec![
            envelope(b"a", 1, OpKind::Set, Some(b"a1")),
            envelope(b"b", 1, OpKind::Set, Some(b"b1")),
            envelope(b"a", 3, OpKind::Set, Some(b"a3")),
            envelope(b"a", 2, OpKind::Set, Some(b"a2")),
        ];
        let coalesced = coalesce(batch);
        assert_eq!(coalesced.len(), 2);
        let a = coalesced.iter().find(|e| e.key == b"a").unwrap();
        assert_eq!(a.version, 3);
        assert_eq!(a.value.as_deref(), Some(b"a3".as_slice()));
    }

    #[test]
    fn test_coalesce_does_not_merge_across_stores() {
        let mut first = envelope(b"k", 2, OpKind::Set, Some(b"v2"));
        first.store = "alpha".into();
        let second = envelope(b"k", 1, OpKind::Set, Some(b"v1"));
        let coalesced = coalesce(vec![first, second]);
        assert_eq!(coalesced.len(), 2);
    }
}
