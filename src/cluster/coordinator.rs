// # Coordinator
//
// Binds the hash ring to the membership view. Subscribes to membership
// events, rebuilds the ring from the active member set on every change,
// publishes the new ring atomically and emits TopologyChanged so routing
// and replication can react. Also the answer desk for "who owns this key".

use crate::cluster::events::{ClusterEvent, EventBus, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::cluster::membership::{Member, Membership};
use crate::cluster::ring::{HashRing, RingHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Coordinator {
    local_id: String,
    membership: Arc<Membership>,
    bus: Arc<EventBus>,
    ring: RingHandle,
    virtual_nodes: u32,
    replication_factor: usize,
    ring_version: AtomicU64,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub local_id: String,
    pub ring_version: u64,
    pub total_members: usize,
    pub alive: usize,
    pub suspect: usize,
    pub dead: usize,
    pub left: usize,
}

impl Coordinator {
    pub fn new(
        membership: Arc<Membership>,
        bus: Arc<EventBus>,
        virtual_nodes: u32,
        replication_factor: usize,
    ) -> Self {
        let local_id = membership.local_id().to_string();
        let initial = HashRing::build(&membership.active_member_ids(), virtual_nodes, 1);
        Self {
            local_id,
            membership,
            bus,
            ring: RingHandle::new(initial),
            virtual_nodes,
            replication_factor,
            ring_version: AtomicU64::new(1),
            shutdown: watch::channel(false).0,
            task: Mutex::new(None),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.snapshot()
    }

    /// Primary owner for a key, if the ring has any members.
    pub fn route_key(&self, key: &[u8]) -> Option<String> {
        self.ring.snapshot().primary(key).map(|s| s.to_string())
    }

    /// Ordered owner list for a key: primary first, then replicas.
    pub fn owners(&self, key: &[u8]) -> Vec<String> {
        self.ring.snapshot().owners(key, self.replication_factor)
    }

    pub fn is_local_primary(&self, key: &[u8]) -> bool {
        self.route_key(key)
            .map(|primary| primary == self.local_id)
            .unwrap_or(true)
    }

    pub fn member(&self, id: &str) -> Option<Member> {
        self.membership.member(id)
    }

    pub fn members(&self) -> Vec<Member> {
        self.membership.members()
    }

    /// Rebuild the ring from the current active member set and announce the
    /// change. Exposed for tests; normally driven by membership events.
    pub fn rebuild_ring(&self) {
        let members = self.membership.active_member_ids();
        let version = self.ring_version.fetch_add(1, Ordering::AcqRel) + 1;
        let ring = HashRing::build(&members, self.virtual_nodes, version);
        info!(
            ring_version = version,
            members = members.len(),
            "ring rebuilt"
        );
        self.ring.publish(ring);
        self.bus
            .publish(ClusterEvent::TopologyChanged { ring_version: version });
    }

    /// Start reconciling membership events into ring changes.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.bus.subscribe("coordinator", DEFAULT_SUBSCRIBER_CAPACITY);
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(envelope) => {
                                if matches!(
                                    envelope.event,
                                    ClusterEvent::MemberJoined { .. }
                                        | ClusterEvent::MemberLeft { .. }
                                        | ClusterEvent::MemberFailed { .. }
                                        | ClusterEvent::MemberRecovered { .. }
                                ) {
                                    this.rebuild_ring();
                                }
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.task.lock() = Some(task);
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
    }

    pub fn health(&self) -> ClusterHealth {
        use crate::cluster::membership::MemberStatus;
        let members = self.membership.members();
        let mut alive = 0;
        let mut suspect = 0;
        let mut dead = 0;
        let mut left = 0;
        for member in &members {
            match member.status {
                MemberStatus::Alive => alive += 1,
                MemberStatus::Suspect => suspect += 1,
                MemberStatus::Dead => dead += 1,
                MemberStatus::Left => left += 1,
            }
        }
        ClusterHealth {
            local_id: self.local_id.clone(),
            ring_version: self.ring.snapshot().version(),
            total_members: members.len(),
            alive,
            suspect,
            dead,
            left,
        }
    }
}
