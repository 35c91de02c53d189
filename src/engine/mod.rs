// # Cache Engine
//
// The multi-store container a node serves from. Routes each operation to
// the named store; stores are independent and never share locks. Batch
// operations are plain iteration, not transactions.

use crate::config::{CacheTuning, StoreConfig};
use crate::error::{CacheError, Result};
use crate::store::{DumpedEntry, EntryInfo, Store, StoreStatsSnapshot, VersionedOp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub struct CacheEngine {
    stores: DashMap<String, Arc<Store>>,
    tuning: CacheTuning,
}

impl CacheEngine {
    pub fn new(tuning: CacheTuning) -> Self {
        Self {
            stores: DashMap::new(),
            tuning,
        }
    }

    /// Build an engine with one store per configuration entry.
    pub fn from_configs(tuning: CacheTuning, stores: &[StoreConfig]) -> Result<Arc<Self>> {
        let engine = Arc::new(Self::new(tuning));
        for config in stores {
            engine.create_store(config.clone())?;
        }
        Ok(engine)
    }

    pub fn create_store(&self, mut config: StoreConfig) -> Result<Arc<Store>> {
        if self.stores.contains_key(&config.name) {
            return Err(CacheError::ConfigInvalid(format!(
                "store already exists: {}",
                config.name
            )));
        }
        if config.default_ttl_secs == 0 {
            config.default_ttl_secs = self.tuning.default_ttl_secs;
        }
        let store = Arc::new(Store::new(config, self.tuning.cuckoo_filter_fpp));
        info!(store = store.name(), policy = %store.policy_kind(), "store created");
        self.stores.insert(store.name().to_string(), store.clone());
        Ok(store)
    }

    pub fn drop_store(&self, name: &str) -> Result<()> {
        self.stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CacheError::UnknownStore(name.to_string()))
    }

    pub fn store(&self, name: &str) -> Result<Arc<Store>> {
        self.stores
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| CacheError::UnknownStore(name.to_string()))
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.key().clone()).collect()
    }

    pub fn get(&self, store: &str, key: &[u8]) -> Result<(Vec<u8>, EntryInfo)> {
        self.store(store)?.get(key)
    }

    pub fn put(
        &self,
        store: &str,
        key: &[u8],
        value: Vec<u8>,
        ttl_secs: Option<u64>,
    ) -> Result<u64> {
        self.store(store)?.put(key, value, ttl_secs)
    }

    pub fn delete(&self, store: &str, key: &[u8]) -> Result<u64> {
        self.store(store)?.delete(key)
    }

    pub fn expire(&self, store: &str, key: &[u8], ttl_secs: u64) -> Result<u64> {
        self.store(store)?.expire(key, ttl_secs)
    }

    pub fn apply_expire(
        &self,
        store: &str,
        key: &[u8],
        expires_at: Option<u64>,
        version: u64,
    ) -> Result<bool> {
        self.store(store)?.apply_expire(key, expires_at, version)
    }

    pub fn exists(&self, store: &str, key: &[u8]) -> Result<bool> {
        Ok(self.store(store)?.exists(key))
    }

    pub fn might_contain(&self, store: &str, key: &[u8]) -> Result<bool> {
        Ok(self.store(store)?.might_contain(key))
    }

    pub fn clear(&self, store: &str) -> Result<usize> {
        Ok(self.store(store)?.clear())
    }

    /// Non-transactional multi-get; missing and expired keys yield None.
    pub fn batch_get(&self, store: &str, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let store = self.store(store)?;
        Ok(keys
            .iter()
            .map(|key| store.get(key).ok().map(|(value, _)| value))
            .collect())
    }

    /// Non-transactional multi-put; each item succeeds or fails on its own.
    pub fn batch_put(
        &self,
        store: &str,
        items: Vec<(Vec<u8>, Vec<u8>, Option<u64>)>,
    ) -> Result<Vec<Result<u64>>> {
        let store = self.store(store)?;
        Ok(items
            .into_iter()
            .map(|(key, value, ttl)| store.put(&key, value, ttl))
            .collect())
    }

    /// Apply a write that carries its own version (replication delivery or
    /// recovery replay).
    pub fn apply_versioned(
        &self,
        store: &str,
        key: &[u8],
        op: VersionedOp,
        version: u64,
    ) -> Result<bool> {
        self.store(store)?.apply_versioned(key, op, version)
    }

    /// Current version for a key, zero when absent or the store is unknown.
    pub fn version_of(&self, store: &str, key: &[u8]) -> u64 {
        self.store(store)
            .map(|s| s.version_of(key))
            .unwrap_or(0)
    }

    /// Copy out the live contents of every store.
    pub fn dump_all(&self) -> Vec<(String, Vec<DumpedEntry>)> {
        self.stores
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().dump()))
            .collect()
    }

    /// Sweep expired entries across all stores; returns total purged.
    pub fn purge_expired(&self, per_store_limit: usize) -> usize {
        self.stores
            .iter()
            .map(|entry| entry.value().purge_expired(per_store_limit))
            .sum()
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        let mut stores = Vec::new();
        let mut total_entries = 0;
        let mut total_memory = 0;
        for entry in self.stores.iter() {
            let store = entry.value();
            total_entries += store.len();
            total_memory += store.memory_used();
            stores.push(StoreStatus {
                name: store.name().to_string(),
                policy: store.policy_kind().to_string(),
                entries: store.len(),
                memory_used: store.memory_used(),
                memory_max: store.memory_max(),
                pressure: store.pressure(),
                filter_load: store.filter_load(),
                stats: store.stats(),
            });
        }
        stores.sort_by(|a, b| a.name.cmp(&b.name));
        EngineStatsSnapshot {
            total_entries,
            total_memory,
            stores,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub name: String,
    pub policy: String,
    pub entries: usize,
    pub memory_used: u64,
    pub memory_max: u64,
    pub pressure: f64,
    pub filter_load: f64,
    pub stats: StoreStatsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub total_entries: usize,
    pub total_memory: u64,
    pub stores: Vec<StoreStatus>,
}
