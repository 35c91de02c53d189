// A single cached value and its bookkeeping. Access statistics use atomics
// so concurrent readers can touch an entry under the store's read lock.

use crate::eviction::EntryMeta;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct Entry {
    value: Vec<u8>,
    created_at: u64,
    expires_at: Option<u64>,
    version: u64,
    /// Bytes charged against the store's memory pool for this entry.
    size: u64,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl Entry {
    pub fn new(
        value: Vec<u8>,
        created_at: u64,
        expires_at: Option<u64>,
        version: u64,
        size: u64,
    ) -> Self {
        Self {
            value,
            created_at,
            expires_at,
            version,
            size,
            last_access: AtomicU64::new(created_at),
            access_count: AtomicU64::new(0),
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Record a read.
    pub fn touch(&self, now: u64) {
        self.last_access.store(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of this entry with a new expiry and version, access statistics
    /// preserved.
    pub fn reexpire(&self, expires_at: Option<u64>, version: u64) -> Entry {
        let entry = Entry::new(
            self.value.clone(),
            self.created_at,
            expires_at,
            version,
            self.size,
        );
        entry
            .last_access
            .store(self.last_access(), Ordering::Relaxed);
        entry
            .access_count
            .store(self.access_count(), Ordering::Relaxed);
        entry
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            size: self.size,
            created_at: self.created_at,
            last_access: self.last_access(),
            access_count: self.access_count(),
            expires_at: self.expires_at,
        }
    }

    #[cfg(test)]
    pub fn backdate_for_test(&self, created_at: u64, last_access: u64) -> Entry {
        let entry = Entry {
            value: self.value.clone(),
            created_at,
            expires_at: self.expires_at,
            version: self.version,
            size: self.size,
            last_access: AtomicU64::new(last_access),
            access_count: AtomicU64::new(self.access_count()),
        };
        entry
    }
}

/// Read-side metadata returned alongside values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub version: u64,
    pub created_at: u64,
    pub last_access: u64,
    pub access_count: u64,
    pub expires_at: Option<u64>,
    pub size: u64,
}

impl EntryInfo {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            version: entry.version(),
            created_at: entry.created_at(),
            last_access: entry.last_access(),
            access_count: entry.access_count(),
            expires_at: entry.expires_at(),
            size: entry.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let entry = Entry::new(b"v".to_vec(), 1000, Some(2000), 1, 10);
        assert!(!entry.is_expired(1999));
        assert!(entry.is_expired(2000));
        let forever = Entry::new(b"v".to_vec(), 1000, None, 1, 10);
        assert!(!forever.is_expired(u64::MAX));
    }

    #[test]
    fn test_touch_updates_access_stats() {
        let entry = Entry::new(b"v".to_vec(), 1000, None, 1, 10);
        assert_eq!(entry.access_count(), 0);
        entry.touch(5000);
        entry.touch(6000);
        assert_eq!(entry.access_count(), 2);
        assert_eq!(entry.last_access(), 6000);
    }

    #[test]
    fn test_meta_reflects_entry() {
        let entry = Entry::new(b"value".to_vec(), 1000, Some(9000), 3, 42);
        entry.touch(1500);
        let meta = entry.meta();
        assert_eq!(meta.size, 42);
        assert_eq!(meta.created_at, 1000);
        assert_eq!(meta.last_access, 1500);
        assert_eq!(meta.expires_at, Some(9000));
    }
}
