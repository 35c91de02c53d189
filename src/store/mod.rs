// # Store
//
// A single named namespace: concurrent entry map, memory pool, eviction
// policy and cuckoo filter kept in lockstep, plus hot-path statistics.
//
// Locking: the map's read-write lock is the store's critical section —
// many concurrent readers, exclusive writers. The policy sits behind its
// own mutex and the filter behind its own rwlock; lock order is always
// map, then policy, then filter. No lock is ever taken in the other
// direction.
//
// Ordering invariant: on Put the filter add happens after the map insert,
// so a reader that sees a filter positive and then misses the map can only
// be observing a transient state that a concurrent writer is about to
// close, never a lost key.

pub mod entry;
pub mod stats;

pub use entry::{Entry, EntryInfo};
pub use stats::{StoreStats, StoreStatsSnapshot};

use crate::common::now_millis;
use crate::config::StoreConfig;
use crate::error::{CacheError, Result};
use crate::eviction::{create_policy, EvictionPolicy, PolicyKind};
use crate::filter::CuckooFilter;
use crate::memory::{entry_size, MemoryPool};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An entry lifted out of a store for snapshots, handoff or replication
/// sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpedEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub version: u64,
}

/// A write applied below the client path: replication or recovery.
#[derive(Debug, Clone)]
pub enum VersionedOp {
    Set {
        value: Vec<u8>,
        created_at: u64,
        expires_at: Option<u64>,
    },
    Delete,
}

enum EvictOutcome {
    Evicted,
    Refused,
    NoCandidate,
}

pub struct Store {
    config: StoreConfig,
    filter_fpp: f64,
    map: RwLock<HashMap<Vec<u8>, Entry>>,
    pool: MemoryPool,
    policy: Mutex<Box<dyn EvictionPolicy>>,
    filter: RwLock<CuckooFilter>,
    stats: StoreStats,
}

impl Store {
    pub fn new(config: StoreConfig, filter_fpp: f64) -> Self {
        let pool = MemoryPool::new(config.max_memory_bytes);
        let policy = create_policy(&config);
        let filter = CuckooFilter::with_capacity(expected_keys(config.max_memory_bytes), filter_fpp);
        Self {
            config,
            filter_fpp,
            map: RwLock::new(HashMap::new()),
            pool,
            policy: Mutex::new(policy),
            filter: RwLock::new(filter),
            stats: StoreStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.config.eviction_policy
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.config.default_ttl_secs
    }

    /// Read a value. Consults the filter first so misses for keys that were
    /// never written stay off the map entirely.
    pub fn get(&self, key: &[u8]) -> Result<(Vec<u8>, EntryInfo)> {
        if !self.filter.read().contains(key) {
            self.stats.record_filter_rejection();
            self.stats.record_miss();
            return Err(CacheError::NotFound);
        }

        enum Lookup {
            Hit(Vec<u8>, EntryInfo, crate::eviction::EntryMeta),
            ExpiredEntry,
            Missing,
        }

        let now = now_millis();
        let outcome = {
            let map = self.map.read();
            match map.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.touch(now);
                    Lookup::Hit(
                        entry.value().to_vec(),
                        EntryInfo::from_entry(entry),
                        entry.meta(),
                    )
                }
                Some(_) => Lookup::ExpiredEntry,
                None => Lookup::Missing,
            }
        };

        match outcome {
            Lookup::Hit(value, info, meta) => {
                self.policy.lock().on_access(key, &meta);
                self.stats.record_hit();
                Ok((value, info))
            }
            Lookup::Missing => {
                self.stats.record_miss();
                Err(CacheError::NotFound)
            }
            Lookup::ExpiredEntry => {
                self.remove_expired(key, now);
                self.stats.record_miss();
                Err(CacheError::Expired)
            }
        }
    }

    /// Write a value. `ttl_secs` of None applies the store default; zero
    /// means no expiry. Returns the entry's new version.
    pub fn put(&self, key: &[u8], value: Vec<u8>, ttl_secs: Option<u64>) -> Result<u64> {
        let required = entry_size(key.len(), value.len());
        if required > self.pool.max() {
            return Err(CacheError::BudgetExceeded {
                needed: required,
                available: self.pool.max(),
            });
        }

        let mut map = self.map.write();
        let mut policy = self.policy.lock();

        // Captured before eviction: even if the old copy of this key is the
        // eviction candidate, the rewrite must continue its version chain.
        let prev_version = map.get(key).map(|e| e.version()).unwrap_or(0);

        // Shed entries the policy considers overdue while the pool is past
        // its pressure threshold.
        while self.pool.needs_eviction() {
            match self.evict_one(&mut map, policy.as_mut(), 0.0) {
                EvictOutcome::Evicted => {}
                _ => break,
            }
        }

        // Free the bytes this write needs; replacing a key reclaims its old
        // charge as part of the same budget.
        loop {
            let reclaimable = map.get(key).map(|e| e.size()).unwrap_or(0);
            if required <= self.pool.available() + reclaimable {
                break;
            }
            let pressure = self.pool.pressure();
            match self.evict_one(&mut map, policy.as_mut(), pressure) {
                EvictOutcome::Evicted => {}
                EvictOutcome::Refused | EvictOutcome::NoCandidate => {
                    return Err(CacheError::BudgetExceeded {
                        needed: required,
                        available: self.pool.available() + reclaimable,
                    });
                }
            }
        }

        let now = now_millis();
        let effective_ttl = ttl_secs.unwrap_or(self.config.default_ttl_secs);
        let expires_at = (effective_ttl > 0).then(|| now + effective_ttl * 1000);

        if let Some(old) = map.remove(key) {
            self.pool.release(old.size());
            policy.on_delete(key);
            self.filter.write().delete(key);
        }

        self.pool.reserve(required)?;
        let version = prev_version + 1;
        let entry = Entry::new(value, now, expires_at, version, required);
        let meta = entry.meta();
        map.insert(key.to_vec(), entry);
        policy.on_insert(key, &meta);

        // Filter add strictly after the map insert.
        if !self.filter.write().add(key) {
            if let Some(entry) = map.remove(key) {
                self.pool.release(entry.size());
            }
            policy.on_delete(key);
            return Err(CacheError::FilterFull);
        }

        self.stats.record_put();
        Ok(version)
    }

    /// Remove a key. Returns the version the removal supersedes, for the
    /// operation log and replication.
    pub fn delete(&self, key: &[u8]) -> Result<u64> {
        let mut map = self.map.write();
        let Some(entry) = map.remove(key) else {
            return Err(CacheError::NotFound);
        };
        let superseded = entry.version() + 1;
        self.pool.release(entry.size());
        self.policy.lock().on_delete(key);
        self.filter.write().delete(key);
        self.stats.record_delete();
        Ok(superseded)
    }

    /// Reset a live key's TTL. Zero clears the expiry. Bumps the version
    /// like any other mutation and returns it.
    pub fn expire(&self, key: &[u8], ttl_secs: u64) -> Result<u64> {
        let now = now_millis();
        let mut map = self.map.write();
        let Some(entry) = map.get(key) else {
            return Err(CacheError::NotFound);
        };
        if entry.is_expired(now) {
            drop(map);
            self.remove_expired(key, now);
            return Err(CacheError::Expired);
        }
        let expires_at = (ttl_secs > 0).then(|| now + ttl_secs * 1000);
        let version = entry.version() + 1;
        let replacement = entry.reexpire(expires_at, version);
        let meta = replacement.meta();
        map.insert(key.to_vec(), replacement);
        self.policy.lock().on_insert(key, &meta);
        Ok(version)
    }

    /// Version-gated expiry change, used by replication and replay.
    pub fn apply_expire(&self, key: &[u8], expires_at: Option<u64>, version: u64) -> Result<bool> {
        let mut map = self.map.write();
        let Some(entry) = map.get(key) else {
            return Ok(false);
        };
        if entry.version() >= version {
            return Ok(false);
        }
        let replacement = entry.reexpire(expires_at, version);
        let meta = replacement.meta();
        map.insert(key.to_vec(), replacement);
        self.policy.lock().on_insert(key, &meta);
        Ok(true)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        let now = now_millis();
        self.map
            .read()
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Filter-only membership check; may report false positives.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.filter.read().contains(key)
    }

    /// Drop every entry and reset the filter.
    pub fn clear(&self) -> usize {
        let mut map = self.map.write();
        let mut policy = self.policy.lock();
        let removed = map.len();
        for (key, entry) in map.drain() {
            self.pool.release(entry.size());
            policy.on_delete(&key);
        }
        *self.filter.write() =
            CuckooFilter::with_capacity(expected_keys(self.config.max_memory_bytes), self.filter_fpp);
        removed
    }

    /// Apply a write that already carries a version: replication delivery
    /// or recovery replay. Older-or-equal versions are dropped.
    pub fn apply_versioned(&self, key: &[u8], op: VersionedOp, version: u64) -> Result<bool> {
        match op {
            VersionedOp::Set {
                value,
                created_at,
                expires_at,
            } => {
                let required = entry_size(key.len(), value.len());
                if required > self.pool.max() {
                    return Err(CacheError::BudgetExceeded {
                        needed: required,
                        available: self.pool.max(),
                    });
                }
                let mut map = self.map.write();
                if map.get(key).map(|e| e.version()).unwrap_or(0) >= version {
                    return Ok(false);
                }
                let mut policy = self.policy.lock();
                loop {
                    let reclaimable = map.get(key).map(|e| e.size()).unwrap_or(0);
                    if required <= self.pool.available() + reclaimable {
                        break;
                    }
                    let pressure = self.pool.pressure();
                    match self.evict_one(&mut map, policy.as_mut(), pressure) {
                        EvictOutcome::Evicted => {}
                        _ => {
                            return Err(CacheError::BudgetExceeded {
                                needed: required,
                                available: self.pool.available() + reclaimable,
                            })
                        }
                    }
                }
                if let Some(old) = map.remove(key) {
                    self.pool.release(old.size());
                    policy.on_delete(key);
                    self.filter.write().delete(key);
                }
                self.pool.reserve(required)?;
                let entry = Entry::new(value, created_at, expires_at, version, required);
                let meta = entry.meta();
                map.insert(key.to_vec(), entry);
                policy.on_insert(key, &meta);
                if !self.filter.write().add(key) {
                    if let Some(entry) = map.remove(key) {
                        self.pool.release(entry.size());
                    }
                    policy.on_delete(key);
                    return Err(CacheError::FilterFull);
                }
                Ok(true)
            }
            VersionedOp::Delete => {
                let mut map = self.map.write();
                match map.get(key) {
                    Some(entry) if entry.version() < version => {
                        let entry = map.remove(key).ok_or(CacheError::NotFound)?;
                        self.pool.release(entry.size());
                        self.policy.lock().on_delete(key);
                        self.filter.write().delete(key);
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
        }
    }

    /// Remove up to `limit` expired entries. Returns how many went.
    pub fn purge_expired(&self, limit: usize) -> usize {
        let now = now_millis();
        let expired: Vec<Vec<u8>> = {
            let map = self.map.read();
            map.iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .take(limit)
                .map(|(key, _)| key.clone())
                .collect()
        };
        let mut purged = 0;
        for key in expired {
            if self.remove_expired(&key, now) {
                purged += 1;
            }
        }
        purged
    }

    /// Copy out all live entries.
    pub fn dump(&self) -> Vec<DumpedEntry> {
        let now = now_millis();
        let map = self.map.read();
        map.iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| DumpedEntry {
                key: key.clone(),
                value: entry.value().to_vec(),
                created_at: entry.created_at(),
                expires_at: entry.expires_at(),
                version: entry.version(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_used(&self) -> u64 {
        self.pool.used()
    }

    pub fn memory_max(&self) -> u64 {
        self.pool.max()
    }

    pub fn pressure(&self) -> f64 {
        self.pool.pressure()
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn filter_load(&self) -> f64 {
        self.filter.read().load_factor()
    }

    /// Version currently held for a key, zero when absent.
    pub fn version_of(&self, key: &[u8]) -> u64 {
        self.map.read().get(key).map(|e| e.version()).unwrap_or(0)
    }

    fn remove_expired(&self, key: &[u8], now: u64) -> bool {
        let mut map = self.map.write();
        match map.get(key) {
            Some(entry) if entry.is_expired(now) => {
                let entry = match map.remove(key) {
                    Some(entry) => entry,
                    None => return false,
                };
                self.pool.release(entry.size());
                self.policy.lock().on_delete(key);
                self.filter.write().delete(key);
                self.stats.record_expiration();
                true
            }
            _ => false,
        }
    }

    fn evict_one(
        &self,
        map: &mut HashMap<Vec<u8>, Entry>,
        policy: &mut dyn EvictionPolicy,
        pressure: f64,
    ) -> EvictOutcome {
        let Some(candidate) = policy.next_candidate() else {
            return EvictOutcome::NoCandidate;
        };
        let Some(entry) = map.get(&candidate) else {
            // Stale policy entry; drop it and report progress.
            policy.on_delete(&candidate);
            return EvictOutcome::Evicted;
        };
        let meta = entry.meta();
        let expired = entry.is_expired(now_millis());
        if !expired && !policy.should_evict(&meta, pressure) {
            return EvictOutcome::Refused;
        }
        if let Some(entry) = map.remove(&candidate) {
            self.pool.release(entry.size());
        }
        policy.on_delete(&candidate);
        self.filter.write().delete(&candidate);
        if expired {
            self.stats.record_expiration();
        } else {
            self.stats.record_eviction();
        }
        EvictOutcome::Evicted
    }

    /// Rewrite an entry's clock fields so policy behavior under aged
    /// workloads can be exercised without sleeping.
    #[cfg(test)]
    pub fn backdate_entry_for_test(&self, key: &[u8], created_at: u64, last_access: u64) {
        let mut map = self.map.write();
        if let Some(entry) = map.get(key) {
            let replacement = entry.backdate_for_test(created_at, last_access);
            let meta = replacement.meta();
            map.insert(key.to_vec(), replacement);
            self.policy.lock().on_insert(key, &meta);
        }
    }
}

/// Rough sizing for the filter: assume small entries so the filter never
/// becomes the limiting structure.
fn expected_keys(budget_bytes: u64) -> usize {
    ((budget_bytes / 256).max(1024)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::PolicyKind;

    fn test_store(policy: PolicyKind, budget: u64) -> Store {
        let mut config = StoreConfig::named("test");
        config.eviction_policy = policy;
        config.max_memory_bytes = budget;
        Store::new(config, 0.001)
    }

    #[test]
    fn test_put_get_delete_round_trip() {
        let store = test_store(PolicyKind::Lru, 1024 * 1024);
        let version = store.put(b"k1", b"v1".to_vec(), None).unwrap();
        assert_eq!(version, 1);

        let (value, info) = store.get(b"k1").unwrap();
        assert_eq!(value, b"v1");
        assert_eq!(info.version, 1);

        store.delete(b"k1").unwrap();
        assert!(matches!(store.get(b"k1"), Err(CacheError::NotFound)));
        assert!(matches!(store.delete(b"k1"), Err(CacheError::NotFound)));
    }

    #[test]
    fn test_version_increments_per_put() {
        let store = test_store(PolicyKind::Lru, 1024 * 1024);
        for expected in 1..=5u64 {
            let version = store.put(b"k", b"v".to_vec(), None).unwrap();
            assert_eq!(version, expected);
        }
    }

    #[test]
    fn test_budget_invariant_after_put() {
        let store = test_store(PolicyKind::Lru, 4096);
        for i in 0..100u32 {
            let key = format!("key-{i}");
            let _ = store.put(key.as_bytes(), vec![0u8; 100], None);
            assert!(store.memory_used() <= store.memory_max());
        }
    }

    #[test]
    fn test_oversized_value_rejected_store_unchanged() {
        let store = test_store(PolicyKind::Lru, 512);
        store.put(b"small", b"x".to_vec(), None).unwrap();
        let before = store.memory_used();
        let err = store.put(b"big", vec![0u8; 4096], None).unwrap_err();
        assert!(matches!(err, CacheError::BudgetExceeded { .. }));
        assert_eq!(store.memory_used(), before);
        assert!(store.exists(b"small"));
    }

    #[test]
    fn test_eviction_frees_space_for_new_put() {
        // Budget for ~3 entries of this size.
        let entry = entry_size(2, 100);
        let store = test_store(PolicyKind::Lru, entry * 3);
        store.put(b"k1", vec![1u8; 100], None).unwrap();
        store.put(b"k2", vec![2u8; 100], None).unwrap();
        store.put(b"k3", vec![3u8; 100], None).unwrap();
        // k1 is least recently used; the next put must evict it.
        store.put(b"k4", vec![4u8; 100], None).unwrap();
        assert!(!store.exists(b"k1"));
        assert!(store.exists(b"k4"));
        assert!(store.stats().evictions >= 1);
        assert!(store.memory_used() <= store.memory_max());
    }

    #[test]
    fn test_filter_tracks_membership() {
        let store = test_store(PolicyKind::Lru, 1024 * 1024);
        assert!(!store.might_contain(b"k"));
        store.put(b"k", b"v".to_vec(), None).unwrap();
        assert!(store.might_contain(b"k"));
        store.delete(b"k").unwrap();
        assert!(!store.might_contain(b"k"));
    }

    #[test]
    fn test_ttl_zero_means_no_expiry() {
        let store = test_store(PolicyKind::Lru, 1024 * 1024);
        store.put(b"k", b"v".to_vec(), Some(0)).unwrap();
        let (_, info) = store.get(b"k").unwrap();
        assert!(info.expires_at.is_none());
    }

    #[test]
    fn test_expired_get_is_lazy_delete() {
        let mut config = StoreConfig::named("t");
        config.max_memory_bytes = 1024 * 1024;
        let store = Store::new(config, 0.001);
        store.put(b"k", b"v".to_vec(), Some(3600)).unwrap();
        // Force the expiry into the past.
        {
            let mut map = store.map.write();
            let old = map.remove(&b"k".to_vec()).unwrap();
            let expired = Entry::new(old.value().to_vec(), 1000, Some(2000), old.version(), old.size());
            map.insert(b"k".to_vec(), expired);
        }
        assert!(matches!(store.get(b"k"), Err(CacheError::Expired)));
        // Entry must be gone now.
        assert_eq!(store.len(), 0);
        assert!(!store.might_contain(b"k"));
        assert_eq!(store.stats().expirations, 1);
    }

    #[test]
    fn test_apply_versioned_gates_on_version() {
        let store = test_store(PolicyKind::Lru, 1024 * 1024);
        let op = |v: &[u8]| VersionedOp::Set {
            value: v.to_vec(),
            created_at: now_millis(),
            expires_at: None,
        };
        assert!(store.apply_versioned(b"k", op(b"v5"), 5).unwrap());
        // Stale version is dropped.
        assert!(!store.apply_versioned(b"k", op(b"v3"), 3).unwrap());
        let (value, info) = store.get(b"k").unwrap();
        assert_eq!(value, b"v5");
        assert_eq!(info.version, 5);
        // Applying the same envelope twice equals applying it once.
        assert!(!store.apply_versioned(b"k", op(b"v5"), 5).unwrap());
    }

    #[test]
    fn test_apply_versioned_delete() {
        let store = test_store(PolicyKind::Lru, 1024 * 1024);
        store.put(b"k", b"v".to_vec(), None).unwrap(); // version 1
        assert!(!store
            .apply_versioned(b"k", VersionedOp::Delete, 1)
            .unwrap());
        assert!(store.exists(b"k"));
        assert!(store
            .apply_versioned(b"k", VersionedOp::Delete, 2)
            .unwrap());
        assert!(!store.exists(b"k"));
    }

    #[test]
    fn test_clear_resets_everything() {
        let store = test_store(PolicyKind::Lfu, 1024 * 1024);
        for i in 0..50u32 {
            store.put(format!("k{i}").as_bytes(), b"v".to_vec(), None).unwrap();
        }
        assert_eq!(store.clear(), 50);
        assert_eq!(store.len(), 0);
        assert_eq!(store.memory_used(), 0);
        assert!(!store.might_contain(b"k0"));
    }

    #[test]
    fn test_dump_skips_expired() {
        let store = test_store(PolicyKind::Lru, 1024 * 1024);
        store.put(b"live", b"v".to_vec(), None).unwrap();
        store.put(b"dead", b"v".to_vec(), Some(3600)).unwrap();
        {
            let mut map = store.map.write();
            let old = map.remove(&b"dead".to_vec()).unwrap();
            map.insert(
                b"dead".to_vec(),
                Entry::new(old.value().to_vec(), 1000, Some(2000), old.version(), old.size()),
            );
        }
        let dump = store.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].key, b"live");
    }

    #[test]
    fn test_session_policy_evicts_oldest_outside_grace() {
        let mut config = StoreConfig::named("sessions");
        config.eviction_policy = PolicyKind::Session;
        // Room for exactly ten small sessions.
        let per_entry = entry_size(2, 64);
        config.max_memory_bytes = per_entry * 10;
        config.session_ttl_secs = 30 * 60;
        config.idle_timeout_secs = 10 * 60;
        config.grace_period_secs = 2 * 60;
        let store = Store::new(config, 0.001);

        let now = now_millis();
        // Nine sessions, last-access between 30s and 8m in the past, all
        // outside the grace period except s0.
        for i in 0..9u64 {
            let key = format!("s{i}");
            store.put(key.as_bytes(), vec![0u8; 64], None).unwrap();
            let age_ms = 30_000 + i * 55_000; // 30s .. ~8m
            store.backdate_entry_for_test(
                key.as_bytes(),
                now - age_ms,
                now - age_ms,
            );
        }

        // One more fits without eviction.
        store.put(b"n1", vec![0u8; 64], None).unwrap();
        assert_eq!(store.stats().evictions, 0);

        // The next one must evict the oldest-access session outside grace:
        // s8 (~8m old).
        store.put(b"n2", vec![0u8; 64], None).unwrap();
        assert_eq!(store.stats().evictions, 1);
        assert!(!store.exists(b"s8"));
        assert!(store.exists(b"n1"));
        assert!(store.exists(b"n2"));
    }

    #[test]
    fn test_purge_expired() {
        let store = test_store(PolicyKind::Lru, 1024 * 1024);
        for i in 0..5u32 {
            store.put(format!("k{i}").as_bytes(), b"v".to_vec(), Some(3600)).unwrap();
        }
        {
            let mut map = store.map.write();
            for i in 0..3u32 {
                let key = format!("k{i}").into_bytes();
                let old = map.remove(&key).unwrap();
                map.insert(
                    key,
                    Entry::new(old.value().to_vec(), 1000, Some(2000), old.version(), old.size()),
                );
            }
        }
        assert_eq!(store.purge_expired(100), 3);
        assert_eq!(store.len(), 2);
    }
}
