// Session-aware policy. Three strata are consulted in order when a
// candidate is needed:
//
//   1. sessions older than the configured session TTL
//   2. sessions idle beyond the idle timeout
//   3. the oldest session outside the grace period
//
// Within a stratum ties go to the oldest last-access. New sessions inside
// the grace period are never chosen.

use super::{EntryMeta, EvictionPolicy, PolicyKind};
use crate::common::now_millis;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicyConfig {
    pub session_ttl_ms: u64,
    pub idle_timeout_ms: u64,
    pub grace_period_ms: u64,
}

impl Default for SessionPolicyConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: 30 * 60 * 1000,
            idle_timeout_ms: 10 * 60 * 1000,
            grace_period_ms: 2 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionState {
    created_at: u64,
    last_access: u64,
    by_access_key: (u64, u64),
    by_created_key: (u64, u64),
}

pub struct SessionPolicy {
    config: SessionPolicyConfig,
    sessions: HashMap<Vec<u8>, SessionState>,
    // (last_access ms, seq) -> key; oldest access first.
    by_access: BTreeMap<(u64, u64), Vec<u8>>,
    // (created_at ms, seq) -> key; oldest session first.
    by_created: BTreeMap<(u64, u64), Vec<u8>>,
    seq: u64,
}

impl SessionPolicy {
    pub fn new(config: SessionPolicyConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            by_access: BTreeMap::new(),
            by_created: BTreeMap::new(),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove_state(&mut self, key: &[u8]) -> Option<SessionState> {
        let state = self.sessions.remove(key)?;
        self.by_access.remove(&state.by_access_key);
        self.by_created.remove(&state.by_created_key);
        Some(state)
    }

    fn stratum_expired(&self, now: u64) -> Option<&Vec<u8>> {
        let (&(created_at, _), key) = self.by_created.iter().next()?;
        if now.saturating_sub(created_at) > self.config.session_ttl_ms {
            Some(key)
        } else {
            None
        }
    }

    fn stratum_idle(&self, now: u64) -> Option<&Vec<u8>> {
        let (&(last_access, _), key) = self.by_access.iter().next()?;
        if now.saturating_sub(last_access) > self.config.idle_timeout_ms {
            Some(key)
        } else {
            None
        }
    }

    fn stratum_oldest_outside_grace(&self, now: u64) -> Option<&Vec<u8>> {
        // Oldest last-access first, skipping sessions still in their grace
        // period. The scan stops at the first survivor, so in the common
        // case this is a single probe.
        for (_, key) in self.by_access.iter() {
            let state = self.sessions.get(key)?;
            if now.saturating_sub(state.created_at) > self.config.grace_period_ms {
                return Some(key);
            }
        }
        None
    }
}

impl EvictionPolicy for SessionPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Session
    }

    fn on_insert(&mut self, key: &[u8], meta: &EntryMeta) {
        self.remove_state(key);
        let access_key = (meta.last_access, self.next_seq());
        let created_key = (meta.created_at, self.next_seq());
        self.sessions.insert(
            key.to_vec(),
            SessionState {
                created_at: meta.created_at,
                last_access: meta.last_access,
                by_access_key: access_key,
                by_created_key: created_key,
            },
        );
        self.by_access.insert(access_key, key.to_vec());
        self.by_created.insert(created_key, key.to_vec());
    }

    fn on_access(&mut self, key: &[u8], meta: &EntryMeta) {
        let Some(state) = self.sessions.get(key).copied() else {
            return;
        };
        self.by_access.remove(&state.by_access_key);
        let access_key = (meta.last_access, self.next_seq());
        self.by_access.insert(access_key, key.to_vec());
        if let Some(state) = self.sessions.get_mut(key) {
            state.last_access = meta.last_access;
            state.by_access_key = access_key;
        }
    }

    fn on_delete(&mut self, key: &[u8]) {
        self.remove_state(key);
    }

    fn should_evict(&self, meta: &EntryMeta, pressure: f64) -> bool {
        let now = now_millis();
        if now.saturating_sub(meta.created_at) > self.config.session_ttl_ms {
            return true;
        }
        if now.saturating_sub(meta.last_access) > self.config.idle_timeout_ms {
            return true;
        }
        // Fresh sessions are protected even under pressure.
        if now.saturating_sub(meta.created_at) <= self.config.grace_period_ms {
            return false;
        }
        pressure > 0.0
    }

    fn next_candidate(&self) -> Option<Vec<u8>> {
        let now = now_millis();
        if let Some(key) = self.stratum_expired(now) {
            return Some(key.clone());
        }
        if let Some(key) = self.stratum_idle(now) {
            return Some(key.clone());
        }
        self.stratum_oldest_outside_grace(now).cloned()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::meta;

    fn test_config() -> SessionPolicyConfig {
        SessionPolicyConfig {
            session_ttl_ms: 30 * 60 * 1000,
            idle_timeout_ms: 10 * 60 * 1000,
            grace_period_ms: 2 * 60 * 1000,
        }
    }

    fn minutes_ago(m: u64) -> u64 {
        now_millis().saturating_sub(m * 60 * 1000)
    }

    #[test]
    fn test_expired_session_wins_over_idle() {
        let mut policy = SessionPolicy::new(test_config());
        policy.on_insert(b"expired", &meta(1, minutes_ago(31), minutes_ago(1)));
        policy.on_insert(b"idle", &meta(1, minutes_ago(20), minutes_ago(15)));
        assert_eq!(policy.next_candidate().unwrap(), b"expired");
    }

    #[test]
    fn test_idle_session_wins_over_old() {
        let mut policy = SessionPolicy::new(test_config());
        policy.on_insert(b"idle", &meta(1, minutes_ago(20), minutes_ago(11)));
        policy.on_insert(b"active", &meta(1, minutes_ago(25), minutes_ago(1)));
        assert_eq!(policy.next_candidate().unwrap(), b"idle");
    }

    #[test]
    fn test_oldest_access_outside_grace() {
        let mut policy = SessionPolicy::new(test_config());
        // Nobody expired or idle; fall through to oldest last-access whose
        // session is older than the grace period.
        policy.on_insert(b"older", &meta(1, minutes_ago(8), minutes_ago(8)));
        policy.on_insert(b"newer", &meta(1, minutes_ago(5), minutes_ago(5)));
        policy.on_insert(b"fresh", &meta(1, minutes_ago(1), minutes_ago(9)));
        assert_eq!(policy.next_candidate().unwrap(), b"older");
    }

    #[test]
    fn test_grace_period_protects_new_sessions() {
        let mut policy = SessionPolicy::new(test_config());
        policy.on_insert(b"fresh", &meta(1, minutes_ago(1), minutes_ago(1)));
        assert!(policy.next_candidate().is_none());
        assert!(!policy.should_evict(&meta(1, minutes_ago(1), minutes_ago(1)), 0.95));
    }

    #[test]
    fn test_access_refreshes_idle_ranking() {
        let mut policy = SessionPolicy::new(test_config());
        policy.on_insert(b"a", &meta(1, minutes_ago(8), minutes_ago(8)));
        policy.on_insert(b"b", &meta(1, minutes_ago(7), minutes_ago(7)));
        policy.on_access(b"a", &meta(1, minutes_ago(8), minutes_ago(0)));
        assert_eq!(policy.next_candidate().unwrap(), b"b");
    }

    #[test]
    fn test_delete_removes_all_tracking() {
        let mut policy = SessionPolicy::new(test_config());
        policy.on_insert(b"a", &meta(1, minutes_ago(31), minutes_ago(31)));
        policy.on_delete(b"a");
        assert!(policy.next_candidate().is_none());
        assert_eq!(policy.len(), 0);
    }
}
