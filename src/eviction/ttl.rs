// TTL-ordered policy. Entries are kept in an expiry-sorted structure;
// already-expired entries surface first, then the nearest-future expiry.
// Entries without an expiry sort last in insertion order.

use super::{EntryMeta, EvictionPolicy, PolicyKind};
use crate::common::now_millis;
use std::collections::{BTreeMap, HashMap};

pub struct TtlPolicy {
    // (expiry ms, insertion seq) -> key; no-expiry entries use u64::MAX.
    by_expiry: BTreeMap<(u64, u64), Vec<u8>>,
    index: HashMap<Vec<u8>, (u64, u64)>,
    seq: u64,
}

impl TtlPolicy {
    pub fn new() -> Self {
        Self {
            by_expiry: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    fn expiry_key(&mut self, meta: &EntryMeta) -> (u64, u64) {
        self.seq += 1;
        (meta.expires_at.unwrap_or(u64::MAX), self.seq)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for TtlPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Ttl
    }

    fn on_insert(&mut self, key: &[u8], meta: &EntryMeta) {
        if let Some(old) = self.index.remove(key) {
            self.by_expiry.remove(&old);
        }
        let position = self.expiry_key(meta);
        self.index.insert(key.to_vec(), position);
        self.by_expiry.insert(position, key.to_vec());
    }

    fn on_access(&mut self, key: &[u8], meta: &EntryMeta) {
        // Expiry can move when a write refreshed the TTL before this access
        // was reported; reposition only when it actually changed.
        if let Some(&(expiry, _)) = self.index.get(key) {
            if expiry != meta.expires_at.unwrap_or(u64::MAX) {
                self.on_insert(key, meta);
            }
        }
    }

    fn on_delete(&mut self, key: &[u8]) {
        if let Some(position) = self.index.remove(key) {
            self.by_expiry.remove(&position);
        }
    }

    fn should_evict(&self, meta: &EntryMeta, pressure: f64) -> bool {
        // Expired entries always go; live ones only once pressure demands.
        meta.is_expired(now_millis()) || pressure > 0.0
    }

    fn next_candidate(&self) -> Option<Vec<u8>> {
        self.by_expiry.values().next().cloned()
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::meta;

    fn meta_expiring(at: u64) -> EntryMeta {
        let mut m = meta(1, 0, 0);
        m.expires_at = Some(at);
        m
    }

    #[test]
    fn test_soonest_expiry_first() {
        let mut policy = TtlPolicy::new();
        policy.on_insert(b"late", &meta_expiring(u64::MAX - 1));
        policy.on_insert(b"soon", &meta_expiring(1));
        policy.on_insert(b"never", &meta(1, 0, 0));
        assert_eq!(policy.next_candidate().unwrap(), b"soon");
    }

    #[test]
    fn test_no_expiry_sorts_last_in_insert_order() {
        let mut policy = TtlPolicy::new();
        policy.on_insert(b"n1", &meta(1, 0, 0));
        policy.on_insert(b"n2", &meta(1, 0, 0));
        assert_eq!(policy.next_candidate().unwrap(), b"n1");
    }

    #[test]
    fn test_reinsert_moves_position() {
        let mut policy = TtlPolicy::new();
        policy.on_insert(b"a", &meta_expiring(5));
        policy.on_insert(b"b", &meta_expiring(10));
        policy.on_insert(b"a", &meta_expiring(20));
        assert_eq!(policy.next_candidate().unwrap(), b"b");
        assert_eq!(policy.len(), 2);
    }

    #[test]
    fn test_expired_should_evict_regardless_of_pressure() {
        let policy = TtlPolicy::new();
        assert!(policy.should_evict(&meta_expiring(1), 0.0));
    }

    #[test]
    fn test_delete_clears_both_maps() {
        let mut policy = TtlPolicy::new();
        policy.on_insert(b"a", &meta_expiring(5));
        policy.on_delete(b"a");
        assert!(policy.next_candidate().is_none());
        assert_eq!(policy.len(), 0);
    }
}
