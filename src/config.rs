// # Node Configuration
//
// Typed configuration document for a HyperCache node. The document is loaded
// from a YAML file, filled in with defaults for anything omitted, and
// validated before the node starts. Every subsystem receives its slice of
// this snapshot; nothing re-reads the file at runtime.

use crate::error::{CacheError, Result};
use crate::eviction::PolicyKind;
use crate::persistence::{PersistenceStrategy, SyncPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HyperCacheConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default = "default_stores")]
    pub stores: Vec<StoreConfig>,
    #[serde(default)]
    pub cache: CacheTuning,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Identity and on-disk location of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node id. Generated when left empty.
    #[serde(default)]
    pub id: String,
    /// Directory for AOF and snapshot files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            data_dir: default_data_dir(),
        }
    }
}

/// Listen addresses for the three surfaces a node exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind")]
    pub resp_bind: String,
    #[serde(default = "default_resp_port")]
    pub resp_port: u16,
    #[serde(default = "default_bind")]
    pub http_bind: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_bind")]
    pub gossip_bind: String,
    /// Address other members use to reach this node's gossip port.
    #[serde(default = "default_advertise")]
    pub gossip_advertise: String,
    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            resp_bind: default_bind(),
            resp_port: default_resp_port(),
            http_bind: default_bind(),
            http_port: default_http_port(),
            gossip_bind: default_bind(),
            gossip_advertise: default_advertise(),
            gossip_port: default_gossip_port(),
        }
    }
}

impl NetworkConfig {
    pub fn resp_addr(&self) -> String {
        format!("{}:{}", self.resp_bind, self.resp_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_bind, self.http_port)
    }

    /// Gossip address advertised to peers.
    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.gossip_advertise, self.gossip_port)
    }

    /// RESP address advertised to clients in MOVED redirects.
    pub fn advertised_resp_addr(&self) -> String {
        format!("{}:{}", self.gossip_advertise, self.resp_port)
    }

    /// HTTP address peers use for forwarding and replication.
    pub fn advertised_http_addr(&self) -> String {
        format!("{}:{}", self.gossip_advertise, self.http_port)
    }
}

/// Requested consistency level. Only eventual consistency is implemented;
/// the knob is validated but adds no semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    #[default]
    Eventual,
}

/// Cluster formation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Gossip addresses of existing members to contact on startup.
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Number of distinct members each key lives on (primary included).
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default)]
    pub consistency_level: ConsistencyLevel,
    /// Virtual points each member places on the hash ring.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
    /// Heartbeat interval for the gossip protocol, in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence before a member is suspected, in milliseconds.
    #[serde(default = "default_suspect_ms")]
    pub suspect_after_ms: u64,
    /// Additional grace before a suspect is declared dead, in milliseconds.
    #[serde(default = "default_dead_ms")]
    pub dead_after_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            replication_factor: default_replication_factor(),
            consistency_level: ConsistencyLevel::Eventual,
            virtual_nodes: default_virtual_nodes(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            suspect_after_ms: default_suspect_ms(),
            dead_after_ms: default_dead_ms(),
        }
    }
}

/// One named store (namespace) on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub name: String,
    #[serde(default)]
    pub eviction_policy: PolicyKind,
    #[serde(default = "default_store_memory")]
    pub max_memory_bytes: u64,
    /// Default TTL applied when a write carries none. Zero means no expiry.
    #[serde(default)]
    pub default_ttl_secs: u64,
    /// Session policy tuning; only read when eviction_policy = session.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl StoreConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            eviction_policy: PolicyKind::default(),
            max_memory_bytes: default_store_memory(),
            default_ttl_secs: 0,
            session_ttl_secs: default_session_ttl(),
            idle_timeout_secs: default_idle_timeout(),
            grace_period_secs: default_grace_period(),
        }
    }
}

/// Node-wide cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTuning {
    /// Upper bound across all stores; store budgets must fit inside it.
    #[serde(default = "default_total_memory")]
    pub max_memory_total: u64,
    #[serde(default = "default_node_ttl")]
    pub default_ttl_secs: u64,
    /// Target false positive rate for each store's cuckoo filter.
    #[serde(default = "default_fpp")]
    pub cuckoo_filter_fpp: f64,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            max_memory_total: default_total_memory(),
            default_ttl_secs: default_node_ttl(),
            cuckoo_filter_fpp: default_fpp(),
        }
    }
}

/// Durability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: PersistenceStrategy,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    /// AOF size that triggers compaction.
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
    /// Gzip level for snapshots; zero disables compression.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// How many snapshot files to keep.
    #[serde(default = "default_retain_snapshots")]
    pub retain_snapshots: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: PersistenceStrategy::default(),
            sync_policy: SyncPolicy::default(),
            snapshot_interval_secs: default_snapshot_interval(),
            max_log_size: default_max_log_size(),
            compression_level: default_compression_level(),
            retain_snapshots: default_retain_snapshots(),
        }
    }
}

// Serde defaults

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_advertise() -> String {
    "127.0.0.1".to_string()
}
fn default_resp_port() -> u16 {
    6380
}
fn default_http_port() -> u16 {
    8080
}
fn default_gossip_port() -> u16 {
    7946
}
fn default_replication_factor() -> usize {
    3
}
fn default_virtual_nodes() -> u32 {
    256
}
fn default_heartbeat_ms() -> u64 {
    1000
}
fn default_suspect_ms() -> u64 {
    3000
}
fn default_dead_ms() -> u64 {
    5000
}
fn default_stores() -> Vec<StoreConfig> {
    vec![StoreConfig::named("default")]
}
fn default_store_memory() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}
fn default_total_memory() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}
fn default_node_ttl() -> u64 {
    3600 // 1 hour
}
fn default_fpp() -> f64 {
    0.001
}
fn default_session_ttl() -> u64 {
    30 * 60
}
fn default_idle_timeout() -> u64 {
    10 * 60
}
fn default_grace_period() -> u64 {
    2 * 60
}
fn default_snapshot_interval() -> u64 {
    300
}
fn default_max_log_size() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}
fn default_compression_level() -> u32 {
    6
}
fn default_retain_snapshots() -> usize {
    3
}

impl HyperCacheConfig {
    /// Load a configuration document from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: HyperCacheConfig = serde_yaml::from_str(&raw)?;
        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill in values that cannot come from serde defaults alone.
    pub fn fill_defaults(&mut self) {
        if self.node.id.is_empty() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            self.node.id = format!("node-{}", &suffix[..8]);
        }
        if self.stores.is_empty() {
            self.stores = default_stores();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            return Err(CacheError::ConfigInvalid("node.id must not be empty".into()));
        }
        if self.network.resp_port == 0
            || self.network.http_port == 0
            || self.network.gossip_port == 0
        {
            return Err(CacheError::ConfigInvalid("ports must be non-zero".into()));
        }
        if self.cluster.replication_factor < 1 {
            return Err(CacheError::ConfigInvalid(
                "cluster.replication_factor must be at least 1".into(),
            ));
        }
        if self.cluster.virtual_nodes == 0 {
            return Err(CacheError::ConfigInvalid(
                "cluster.virtual_nodes must be at least 1".into(),
            ));
        }
        if !(self.cache.cuckoo_filter_fpp > 0.0 && self.cache.cuckoo_filter_fpp < 1.0) {
            return Err(CacheError::ConfigInvalid(
                "cache.cuckoo_filter_fpp must be in (0, 1)".into(),
            ));
        }
        let mut names = HashSet::new();
        let mut total_budget = 0u64;
        for store in &self.stores {
            if store.name.is_empty() {
                return Err(CacheError::ConfigInvalid("store name must not be empty".into()));
            }
            if !names.insert(store.name.as_str()) {
                return Err(CacheError::ConfigInvalid(format!(
                    "duplicate store name: {}",
                    store.name
                )));
            }
            if store.max_memory_bytes == 0 {
                return Err(CacheError::ConfigInvalid(format!(
                    "store {} has zero memory budget",
                    store.name
                )));
            }
            total_budget = total_budget.saturating_add(store.max_memory_bytes);
        }
        if total_budget > self.cache.max_memory_total {
            return Err(CacheError::ConfigInvalid(format!(
                "store budgets sum to {} bytes, above cache.max_memory_total {}",
                total_budget, self.cache.max_memory_total
            )));
        }
        if self.persistence.enabled && self.persistence.max_log_size == 0 {
            return Err(CacheError::ConfigInvalid(
                "persistence.max_log_size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Find the configuration of a named store.
    pub fn store(&self, name: &str) -> Option<&StoreConfig> {
        self.stores.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> HyperCacheConfig {
        let mut config = HyperCacheConfig::default();
        config.fill_defaults();
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert!(config.node.id.starts_with("node-"));
        assert_eq!(config.stores.len(), 1);
        assert_eq!(config.stores[0].name, "default");
    }

    #[test]
    fn test_duplicate_store_rejected() {
        let mut config = valid_config();
        config.stores.push(StoreConfig::named("default"));
        assert!(matches!(
            config.validate(),
            Err(CacheError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_replication_factor_floor() {
        let mut config = valid_config();
        config.cluster.replication_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fpp_range() {
        let mut config = valid_config();
        config.cache.cuckoo_filter_fpp = 1.5;
        assert!(config.validate().is_err());
        config.cache.cuckoo_filter_fpp = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_budgets_capped_by_total() {
        let mut config = valid_config();
        config.cache.max_memory_total = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = valid_config();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: HyperCacheConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.node.id, config.node.id);
        assert_eq!(parsed.cluster.replication_factor, 3);
    }

    #[test]
    fn test_minimal_yaml_parses() {
        let yaml = "node:\n  id: n1\nstores:\n  - name: sessions\n    eviction_policy: session\n";
        let mut config: HyperCacheConfig = serde_yaml::from_str(yaml).unwrap();
        config.fill_defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.id, "n1");
        assert_eq!(config.stores[0].name, "sessions");
        assert_eq!(config.stores[0].eviction_policy, PolicyKind::Session);
    }

    #[test]
    fn test_unknown_policy_rejected_by_serde() {
        let yaml = "stores:\n  - name: s\n    eviction_policy: arc\n";
        assert!(serde_yaml::from_str::<HyperCacheConfig>(yaml).is_err());
    }
}
