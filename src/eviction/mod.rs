// # Eviction Policies
//
// Pluggable candidate selection for stores under memory pressure. Every
// policy tracks the same key set as the store map and answers in O(1)
// amortized time on the hot path. Policy nodes live in slab-allocated
// vectors addressed by index; there are no pointer cycles to manage.
//
// Variants:
// - LRU: doubly-linked recency list, candidate is the tail
// - LFU: frequency buckets, candidate comes from the minimum bucket
// - FIFO: insertion-order list, access is a no-op
// - TTL: expiry-ordered, already-expired beats nearest-future
// - Session: expired > idle > oldest-outside-grace strata

pub mod fifo;
pub mod lfu;
pub mod lru;
pub mod session;
pub mod ttl;

pub use fifo::FifoPolicy;
pub use lfu::LfuPolicy;
pub use lru::LruPolicy;
pub use session::{SessionPolicy, SessionPolicyConfig};
pub use ttl::TtlPolicy;

use crate::config::StoreConfig;
use serde::{Deserialize, Serialize};

/// Which eviction policy a store runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Lru,
    Lfu,
    Fifo,
    Ttl,
    Session,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyKind::Lru => "lru",
            PolicyKind::Lfu => "lfu",
            PolicyKind::Fifo => "fifo",
            PolicyKind::Ttl => "ttl",
            PolicyKind::Session => "session",
        };
        f.write_str(name)
    }
}

/// The slice of entry state policies are allowed to see. Timestamps are
/// epoch milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    pub size: u64,
    pub created_at: u64,
    pub last_access: u64,
    pub access_count: u64,
    pub expires_at: Option<u64>,
}

impl EntryMeta {
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Candidate selection over the keys a store currently holds.
///
/// The store keeps the policy in lockstep with its map: every map insert,
/// access and delete is mirrored here. `next_candidate` peeks without
/// removing; the store removes the entry and reports it back via
/// `on_delete`.
pub trait EvictionPolicy: Send {
    fn kind(&self) -> PolicyKind;

    fn on_insert(&mut self, key: &[u8], meta: &EntryMeta);

    fn on_access(&mut self, key: &[u8], meta: &EntryMeta);

    fn on_delete(&mut self, key: &[u8]);

    /// Whether the candidate meets this policy's removal criteria under the
    /// current memory pressure.
    fn should_evict(&self, meta: &EntryMeta, pressure: f64) -> bool;

    /// The key this policy would evict next, if any.
    fn next_candidate(&self) -> Option<Vec<u8>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the policy a store's configuration names.
pub fn create_policy(config: &StoreConfig) -> Box<dyn EvictionPolicy> {
    match config.eviction_policy {
        PolicyKind::Lru => Box::new(LruPolicy::new()),
        PolicyKind::Lfu => Box::new(LfuPolicy::new()),
        PolicyKind::Fifo => Box::new(FifoPolicy::new()),
        PolicyKind::Ttl => Box::new(TtlPolicy::new()),
        PolicyKind::Session => Box::new(SessionPolicy::new(SessionPolicyConfig {
            session_ttl_ms: config.session_ttl_secs * 1000,
            idle_timeout_ms: config.idle_timeout_secs * 1000,
            grace_period_ms: config.grace_period_secs * 1000,
        })),
    }
}

#[cfg(test)]
pub(crate) fn meta(size: u64, created_at: u64, last_access: u64) -> EntryMeta {
    EntryMeta {
        size,
        created_at,
        last_access,
        access_count: 0,
        expires_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_kind_names() {
        assert_eq!(PolicyKind::Lru.to_string(), "lru");
        assert_eq!(PolicyKind::Session.to_string(), "session");
    }

    #[test]
    fn test_factory_builds_each_kind() {
        for kind in [
            PolicyKind::Lru,
            PolicyKind::Lfu,
            PolicyKind::Fifo,
            PolicyKind::Ttl,
            PolicyKind::Session,
        ] {
            let mut config = StoreConfig::named("t");
            config.eviction_policy = kind;
            let policy = create_policy(&config);
            assert_eq!(policy.kind(), kind);
            assert!(policy.is_empty());
        }
    }

    #[test]
    fn test_meta_expiry() {
        let mut m = meta(10, 0, 0);
        assert!(!m.is_expired(u64::MAX));
        m.expires_at = Some(100);
        assert!(!m.is_expired(99));
        assert!(m.is_expired(100));
    }
}
