// # Cluster Membership
//
// Gossip-based membership with failure detection, in the SWIM family:
// - heartbeat pings carry piggybacked membership updates (full state for
//   the cluster sizes this targets)
// - a silent member becomes suspect, then dead after a further grace
// - incarnation numbers let a live member refute stale suspicion
// - graceful leave broadcasts a Leave so peers skip the suspicion dance
//
// Transport is UDP datagrams of bincode-encoded messages. Membership
// transitions are published on the event bus; the coordinator turns them
// into ring changes. The local member is always part of its own view.

use crate::cluster::events::{ClusterEvent, EventBus};
use crate::common::now_millis;
use crate::error::{CacheError, Result};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type MemberId = String;

/// Largest datagram the gossip layer will send or accept.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Peers contacted per heartbeat round.
const GOSSIP_FANOUT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl MemberStatus {
    fn rank(self) -> u8 {
        match self {
            MemberStatus::Alive => 0,
            MemberStatus::Suspect => 1,
            MemberStatus::Dead => 2,
            MemberStatus::Left => 3,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, MemberStatus::Alive | MemberStatus::Suspect)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    /// Address peers gossip with.
    pub gossip_addr: String,
    /// RESP endpoint advertised in MOVED redirects.
    pub resp_addr: String,
    /// HTTP endpoint used for forwarding and replication.
    pub http_addr: String,
    pub status: MemberStatus,
    pub incarnation: u64,
    pub last_heard_ms: u64,
    pub metadata: HashMap<String, String>,
}

impl Member {
    pub fn new(id: MemberId, gossip_addr: String, resp_addr: String, http_addr: String) -> Self {
        Self {
            id,
            gossip_addr,
            resp_addr,
            http_addr,
            status: MemberStatus::Alive,
            incarnation: 0,
            last_heard_ms: now_millis(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: MemberId,
        updates: Vec<Member>,
    },
    Ack {
        from: MemberId,
        updates: Vec<Member>,
    },
    Join {
        member: Member,
    },
    Leave {
        from: MemberId,
        incarnation: u64,
    },
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub bind: String,
    pub port: u16,
    pub seeds: Vec<String>,
    pub heartbeat_interval: Duration,
    /// Silence before a member becomes suspect.
    pub suspect_after: Duration,
    /// Additional silence before a suspect is declared dead.
    pub dead_after: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7946,
            seeds: Vec::new(),
            heartbeat_interval: Duration::from_millis(1000),
            suspect_after: Duration::from_millis(3000),
            dead_after: Duration::from_millis(5000),
        }
    }
}

pub struct Membership {
    config: MembershipConfig,
    local_id: MemberId,
    members: RwLock<HashMap<MemberId, Member>>,
    incarnation: AtomicU64,
    bus: Arc<EventBus>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Membership {
    pub fn new(local: Member, config: MembershipConfig, bus: Arc<EventBus>) -> Self {
        let local_id = local.id.clone();
        let mut members = HashMap::new();
        members.insert(local_id.clone(), local);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            local_id,
            members: RwLock::new(members),
            incarnation: AtomicU64::new(0),
            bus,
            socket: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Bind the gossip socket, contact the seeds and start the heartbeat
    /// and failure detector tasks.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let bind_addr = format!("{}:{}", self.config.bind, self.config.port);
        let socket = Arc::new(UdpSocket::bind(&bind_addr).await.map_err(|e| {
            CacheError::Transport(format!("gossip bind {bind_addr} failed: {e}"))
        })?);
        let bound = socket
            .local_addr()
            .map_err(|e| CacheError::Transport(e.to_string()))?;
        *self.socket.lock() = Some(socket.clone());

        // An ephemeral port only becomes known after bind.
        if self.config.port == 0 {
            let mut members = self.members.write();
            if let Some(local) = members.get_mut(&self.local_id) {
                local.gossip_addr = bound.to_string();
            }
        }

        info!(addr = %bound, id = %self.local_id, "gossip listening");

        self.spawn_receiver(socket);
        self.spawn_heartbeat();
        self.spawn_failure_detector();

        // Introduce ourselves to the seeds.
        let join = GossipMessage::Join {
            member: self.local_snapshot(),
        };
        for seed in self.config.seeds.clone() {
            if let Err(e) = self.send(&join, &seed).await {
                warn!(seed = %seed, error = %e, "seed unreachable at join");
            }
        }
        Ok(bound)
    }

    /// Broadcast a Leave and stop all background tasks.
    pub async fn leave(&self) {
        let incarnation = self.incarnation.load(Ordering::Acquire);
        let message = GossipMessage::Leave {
            from: self.local_id.clone(),
            incarnation,
        };
        let peers = self.active_peer_addrs();
        for addr in peers {
            let _ = self.send(&message, &addr).await;
        }
        {
            let mut members = self.members.write();
            if let Some(local) = members.get_mut(&self.local_id) {
                local.status = MemberStatus::Left;
            }
        }
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    pub fn member(&self, id: &str) -> Option<Member> {
        self.members.read().get(id).cloned()
    }

    /// Ids of members usable for key ownership: alive or still only
    /// suspect, the local member included.
    pub fn active_member_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .members
            .read()
            .values()
            .filter(|m| m.status.is_active())
            .map(|m| m.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Merge one gossiped member record into the local view, emitting
    /// membership events for observable transitions.
    pub fn merge_update(&self, update: Member) {
        if update.id == self.local_id {
            self.maybe_refute(&update);
            return;
        }

        let event = {
            let mut members = self.members.write();
            match members.get_mut(&update.id) {
                Some(existing) => {
                    let newer = update.incarnation > existing.incarnation
                        || (update.incarnation == existing.incarnation
                            && update.status.rank() > existing.status.rank());
                    if !newer {
                        None
                    } else {
                        let was = existing.status;
                        existing.incarnation = update.incarnation;
                        existing.status = update.status;
                        existing.gossip_addr = update.gossip_addr.clone();
                        existing.resp_addr = update.resp_addr.clone();
                        existing.http_addr = update.http_addr.clone();
                        existing.metadata = update.metadata.clone();
                        transition_event(&update.id, was, update.status)
                    }
                }
                None => {
                    let id = update.id.clone();
                    let status = update.status;
                    members.insert(id.clone(), update);
                    if status.is_active() {
                        Some(ClusterEvent::MemberJoined { id })
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(event) = event {
            debug!(event = event.kind(), "membership transition");
            self.bus.publish(event);
        }
    }

    /// Direct contact from a member proves it is alive.
    pub fn mark_heard(&self, id: &str) {
        let event = {
            let mut members = self.members.write();
            match members.get_mut(id) {
                Some(member) => {
                    member.last_heard_ms = now_millis();
                    match member.status {
                        MemberStatus::Suspect => {
                            member.status = MemberStatus::Alive;
                            None
                        }
                        MemberStatus::Dead => {
                            member.status = MemberStatus::Alive;
                            member.incarnation += 1;
                            Some(ClusterEvent::MemberRecovered { id: id.to_string() })
                        }
                        _ => None,
                    }
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.bus.publish(event);
        }
    }

    /// One failure-detector pass; exposed for tests, normally driven by the
    /// background task.
    pub fn detect_failures(&self) {
        let now = now_millis();
        let suspect_after = self.config.suspect_after.as_millis() as u64;
        let dead_after = self.config.dead_after.as_millis() as u64;
        let mut events = Vec::new();
        {
            let mut members = self.members.write();
            for member in members.values_mut() {
                if member.id == self.local_id {
                    continue;
                }
                let silence = now.saturating_sub(member.last_heard_ms);
                match member.status {
                    MemberStatus::Alive if silence > suspect_after => {
                        member.status = MemberStatus::Suspect;
                        debug!(id = %member.id, silence_ms = silence, "member suspected");
                    }
                    MemberStatus::Suspect if silence > suspect_after + dead_after => {
                        member.status = MemberStatus::Dead;
                        events.push(ClusterEvent::MemberFailed {
                            id: member.id.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }
        for event in events {
            warn!(event = event.kind(), "failure detector transition");
            self.bus.publish(event);
        }
    }

    pub fn handle_message(self: &Arc<Self>, message: GossipMessage, src: SocketAddr) {
        match message {
            GossipMessage::Ping { from, updates } => {
                self.mark_heard(&from);
                for update in updates {
                    self.merge_update(update);
                }
                let ack = GossipMessage::Ack {
                    from: self.local_id.clone(),
                    updates: self.view_snapshot(),
                };
                let this = self.clone();
                tokio::spawn(async move {
                    let _ = this.send(&ack, &src.to_string()).await;
                });
            }
            GossipMessage::Ack { from, updates } => {
                self.mark_heard(&from);
                for update in updates {
                    self.merge_update(update);
                }
            }
            GossipMessage::Join { member } => {
                let reply_to = member.gossip_addr.clone();
                self.merge_update(member);
                // Answer with our full view so the joiner converges fast.
                let ack = GossipMessage::Ack {
                    from: self.local_id.clone(),
                    updates: self.view_snapshot(),
                };
                let this = self.clone();
                tokio::spawn(async move {
                    let _ = this.send(&ack, &reply_to).await;
                });
            }
            GossipMessage::Leave { from, incarnation } => {
                let event = {
                    let mut members = self.members.write();
                    match members.get_mut(&from) {
                        Some(member) if member.status != MemberStatus::Left => {
                            member.status = MemberStatus::Left;
                            member.incarnation = member.incarnation.max(incarnation);
                            Some(ClusterEvent::MemberLeft { id: from.clone() })
                        }
                        _ => None,
                    }
                };
                if let Some(event) = event {
                    info!(id = %from, "member left");
                    self.bus.publish(event);
                }
            }
        }
    }

    fn maybe_refute(&self, update: &Member) {
        let ours = self.incarnation.load(Ordering::Acquire);
        let slandered = update.incarnation >= ours && update.status != MemberStatus::Alive;
        if slandered {
            let refuted = update.incarnation + 1;
            self.incarnation.store(refuted, Ordering::Release);
            let mut members = self.members.write();
            if let Some(local) = members.get_mut(&self.local_id) {
                local.incarnation = refuted;
                local.status = MemberStatus::Alive;
            }
            debug!(incarnation = refuted, "refuted suspicion about self");
        }
    }

    fn local_snapshot(&self) -> Member {
        self.members
            .read()
            .get(&self.local_id)
            .cloned()
            .unwrap_or_else(|| {
                Member::new(self.local_id.clone(), String::new(), String::new(), String::new())
            })
    }

    fn view_snapshot(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    fn active_peer_addrs(&self) -> Vec<String> {
        self.members
            .read()
            .values()
            .filter(|m| m.id != self.local_id && m.status.is_active())
            .map(|m| m.gossip_addr.clone())
            .collect()
    }

    async fn send(&self, message: &GossipMessage, addr: &str) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or_else(|| CacheError::Transport("gossip socket not bound".into()))?;
        let bytes = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(CacheError::Transport(format!(
                "gossip message of {} bytes exceeds datagram limit",
                bytes.len()
            )));
        }
        socket
            .send_to(&bytes, addr)
            .await
            .map_err(|e| CacheError::Transport(format!("gossip send to {addr} failed: {e}")))?;
        Ok(())
    }

    fn spawn_receiver(self: &Arc<Self>, socket: Arc<UdpSocket>) {
        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, src)) => {
                                match bincode::serde::decode_from_slice::<GossipMessage, _>(
                                    &buf[..len],
                                    bincode::config::standard(),
                                ) {
                                    Ok((message, _)) => this.handle_message(message, src),
                                    Err(e) => debug!(error = %e, src = %src, "undecodable gossip datagram"),
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "gossip receive failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.heartbeat_interval;
        self.tasks.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.heartbeat_round().await,
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    fn spawn_failure_detector(self: &Arc<Self>) {
        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.heartbeat_interval;
        self.tasks.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.detect_failures(),
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    async fn heartbeat_round(&self) {
        let peers = self.active_peer_addrs();
        if peers.is_empty() {
            return;
        }
        let updates = self.view_snapshot();
        let ping = GossipMessage::Ping {
            from: self.local_id.clone(),
            updates,
        };
        let targets = pick_random(&peers, GOSSIP_FANOUT);
        for addr in targets {
            if let Err(e) = self.send(&ping, &addr).await {
                debug!(addr = %addr, error = %e, "heartbeat send failed");
            }
        }
    }
}

fn pick_random(items: &[String], n: usize) -> Vec<String> {
    if items.len() <= n {
        return items.to_vec();
    }
    let mut rng = rand::rng();
    let mut chosen = Vec::with_capacity(n);
    let mut pool: Vec<&String> = items.iter().collect();
    for _ in 0..n {
        let index = rng.random_range(0..pool.len());
        chosen.push(pool.swap_remove(index).clone());
    }
    chosen
}

fn transition_event(id: &str, was: MemberStatus, now: MemberStatus) -> Option<ClusterEvent> {
    match (was, now) {
        (MemberStatus::Dead, MemberStatus::Alive) | (MemberStatus::Left, MemberStatus::Alive) => {
            Some(ClusterEvent::MemberRecovered { id: id.to_string() })
        }
        (previous, MemberStatus::Dead) if previous != MemberStatus::Dead => {
            Some(ClusterEvent::MemberFailed { id: id.to_string() })
        }
        (previous, MemberStatus::Left) if previous != MemberStatus::Left => {
            Some(ClusterEvent::MemberLeft { id: id.to_string() })
        }
        _ => None,
    }
}
