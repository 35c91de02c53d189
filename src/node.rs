// # Node
//
// Assembles a running HyperCache node from a validated configuration:
// engine, persistence (recovery before serving), gossip membership,
// coordinator, replicator, router and the two protocol servers, plus the
// cluster event fan-out and the expired-entry reaper. Owns ordered
// shutdown.

use crate::cluster::coordinator::Coordinator;
use crate::cluster::events::EventBus;
use crate::cluster::membership::{Member, Membership, MembershipConfig};
use crate::cluster::replication::Replicator;
use crate::cluster::router::RequestRouter;
use crate::common::now_millis;
use crate::config::HyperCacheConfig;
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::network::http::{self, AppState};
use crate::network::resp::RespServer;
use crate::network::transport::NodeTransport;
use crate::persistence::PersistenceEngine;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Peers contacted per cluster-wide event publish.
const EVENT_FANOUT: usize = 3;

/// Cadence of the expired-entry reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Expired entries removed per store per reaper pass.
const REAPER_BATCH: usize = 256;

pub struct Node {
    config: HyperCacheConfig,
    engine: Arc<CacheEngine>,
    persistence: Arc<PersistenceEngine>,
    membership: Arc<Membership>,
    coordinator: Arc<Coordinator>,
    bus: Arc<EventBus>,
    replicator: Arc<Replicator>,
    router: Arc<RequestRouter>,
    transport: Arc<NodeTransport>,
    state: Arc<AppState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(mut config: HyperCacheConfig) -> Result<Self> {
        config.fill_defaults();
        config.validate()?;
        let node_id = config.node.id.clone();

        let bus = Arc::new(EventBus::new(node_id.clone()));
        let engine = CacheEngine::from_configs(config.cache.clone(), &config.stores)?;
        let persistence = Arc::new(PersistenceEngine::new(
            config.persistence.clone(),
            &config.node,
        )?);

        let local = Member::new(
            node_id.clone(),
            config.network.gossip_addr(),
            config.network.advertised_resp_addr(),
            config.network.advertised_http_addr(),
        );
        let membership = Arc::new(Membership::new(
            local,
            MembershipConfig {
                bind: config.network.gossip_bind.clone(),
                port: config.network.gossip_port,
                seeds: config.cluster.seeds.clone(),
                heartbeat_interval: Duration::from_millis(config.cluster.heartbeat_interval_ms),
                suspect_after: Duration::from_millis(config.cluster.suspect_after_ms),
                dead_after: Duration::from_millis(config.cluster.dead_after_ms),
            },
            bus.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            membership.clone(),
            bus.clone(),
            config.cluster.virtual_nodes,
            config.cluster.replication_factor,
        ));
        let transport = Arc::new(NodeTransport::new(node_id.clone())?);
        let replicator = Arc::new(Replicator::new(
            coordinator.clone(),
            transport.clone(),
            engine.clone(),
        ));
        let router = Arc::new(RequestRouter::new(
            engine.clone(),
            coordinator.clone(),
            replicator.clone(),
            persistence.clone(),
            transport.clone(),
        ));

        let state = Arc::new(AppState {
            router: router.clone(),
            engine: engine.clone(),
            coordinator: coordinator.clone(),
            replicator: replicator.clone(),
            persistence: persistence.clone(),
            bus: bus.clone(),
            config: config.clone(),
            ready: AtomicBool::new(false),
            started_at_ms: now_millis(),
        });

        Ok(Self {
            config,
            engine,
            persistence,
            membership,
            coordinator,
            bus,
            replicator,
            router,
            transport,
            state,
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        self.coordinator.local_id()
    }

    pub fn engine(&self) -> Arc<CacheEngine> {
        self.engine.clone()
    }

    pub fn router(&self) -> Arc<RequestRouter> {
        self.router.clone()
    }

    /// Recover state, join the cluster and bring both protocol surfaces
    /// up. Returns once the node is serving.
    pub async fn start(&self) -> Result<()> {
        let report = self.persistence.recover(&self.engine)?;
        if report.snapshot_entries > 0 || report.replayed_records > 0 {
            info!(
                snapshot_entries = report.snapshot_entries,
                replayed = report.replayed_records,
                "state recovered before serving"
            );
        }
        self.persistence.start(self.engine.clone());

        self.membership.start().await?;
        self.coordinator.start();
        self.replicator.start();
        self.spawn_event_fanout();
        self.spawn_reaper();

        let resp_addr = self.config.network.resp_addr();
        let resp_listener = TcpListener::bind(&resp_addr)
            .await
            .map_err(|e| CacheError::Transport(format!("RESP bind {resp_addr} failed: {e}")))?;
        let resp_server = RespServer::new(
            self.router.clone(),
            self.default_store(),
            self.shutdown.subscribe(),
        );
        self.tasks.lock().push(tokio::spawn(async move {
            if let Err(e) = resp_server.run(resp_listener).await {
                error!(error = %e, "RESP server exited");
            }
        }));

        let http_addr = self.config.network.http_addr();
        let http_listener = TcpListener::bind(&http_addr)
            .await
            .map_err(|e| CacheError::Transport(format!("HTTP bind {http_addr} failed: {e}")))?;
        let http_state = self.state.clone();
        let http_shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(async move {
            if let Err(e) = http::run(http_listener, http_state, http_shutdown).await {
                error!(error = %e, "HTTP server exited");
            }
        }));

        self.state.ready.store(true, Ordering::Release);
        info!(
            id = %self.id(),
            resp = %self.config.network.resp_addr(),
            http = %self.config.network.http_addr(),
            gossip = %self.config.network.gossip_addr(),
            stores = self.engine.store_names().len(),
            "node serving"
        );
        Ok(())
    }

    /// Ordered shutdown: stop accepting, leave the cluster, drain
    /// replication, flush persistence.
    pub async fn stop(&self) {
        info!(id = %self.id(), "node stopping");
        self.state.ready.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);

        self.membership.leave().await;
        self.replicator.stop().await;
        self.coordinator.stop().await;
        self.persistence.stop().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(id = %self.id(), "node stopped");
    }

    fn default_store(&self) -> String {
        self.config
            .stores
            .first()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Forward cluster-wide event envelopes to a bounded set of peers.
    fn spawn_event_fanout(&self) {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.bus.set_outbound(sender);
        let coordinator = self.coordinator.clone();
        let transport = self.transport.clone();
        let local_id = self.id().to_string();
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    received = receiver.recv() => match received {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };
                let peers: Vec<_> = coordinator
                    .members()
                    .into_iter()
                    .filter(|m| m.id != local_id && m.status.is_active())
                    .take(EVENT_FANOUT)
                    .collect();
                for peer in peers {
                    if let Err(e) = transport.send_event(&peer.http_addr, &envelope).await {
                        warn!(peer = %peer.id, error = %e, "event fan-out failed");
                    }
                }
            }
        }));
    }

    /// Bound the memory held by expired entries nobody reads.
    fn spawn_reaper(&self) {
        let engine = self.engine.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = engine.purge_expired(REAPER_BATCH);
                        if purged > 0 {
                            info!(purged, "reaper removed expired entries");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HyperCacheConfig;

    fn test_config(resp_port: u16, http_port: u16, gossip_port: u16) -> HyperCacheConfig {
        let mut config = HyperCacheConfig::default();
        config.fill_defaults();
        config.node.data_dir = std::env::temp_dir().join(format!(
            "hypercache-node-test-{}",
            uuid::Uuid::new_v4().simple()
        ));
        config.network.resp_bind = "127.0.0.1".into();
        config.network.http_bind = "127.0.0.1".into();
        config.network.resp_port = resp_port;
        config.network.http_port = http_port;
        config.network.gossip_port = gossip_port;
        config
    }

    #[test]
    fn test_node_builds_from_default_config() {
        let node = Node::new(test_config(16390, 18090, 17990)).unwrap();
        assert!(!node.id().is_empty());
        assert_eq!(node.default_store(), "default");
        assert_eq!(node.engine.store_names(), vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn test_node_start_and_stop() {
        let node = Node::new(test_config(16391, 18091, 17991)).unwrap();
        node.start().await.unwrap();
        assert!(node.state.ready.load(Ordering::Acquire));

        // The node serves its own keys while alone in the ring.
        node.engine
            .put("default", b"k", b"v".to_vec(), None)
            .unwrap();
        assert_eq!(node.engine.get("default", b"k").unwrap().0, b"v");

        node.stop().await;
        assert!(!node.state.ready.load(Ordering::Acquire));
    }
}
