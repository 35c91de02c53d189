// # Cuckoo Filter
//
// Probabilistic set membership with deletion support. Each key is reduced
// to a short fingerprint stored in one of two candidate buckets; the
// alternative bucket is derived from the first by XOR with a mix of the
// fingerprint, which makes the pair reciprocal given only the fingerprint
// and either index — the property relocation relies on.
//
// Guarantees:
// - no false negatives for keys added and not deleted
// - false positive rate ≈ slots_per_bucket * 2^-fingerprint_bits
// - deletion is only sound for keys previously added; the store enforces
//   this by deleting only keys its map confirmed present

use rand::Rng;
use std::hash::{Hash, Hasher};

/// Slots per bucket.
pub const SLOTS_PER_BUCKET: usize = 4;

/// Relocation chain length before the filter reports itself full.
pub const MAX_KICKS: usize = 500;

/// Target load factor used when sizing from an expected key count.
const TARGET_LOAD: f64 = 0.85;

const EMPTY: u16 = 0;

pub struct CuckooFilter {
    buckets: Vec<[u16; SLOTS_PER_BUCKET]>,
    bucket_mask: usize,
    fingerprint_bits: u32,
    fingerprint_mask: u64,
    len: usize,
}

impl CuckooFilter {
    /// Size the filter for `expected_keys` at the configured false positive
    /// target. Fingerprint width is derived as ceil(log2(slots / fpp)).
    pub fn with_capacity(expected_keys: usize, fpp: f64) -> Self {
        let fingerprint_bits = derive_fingerprint_bits(fpp);
        let wanted = ((expected_keys.max(1) as f64) / (SLOTS_PER_BUCKET as f64 * TARGET_LOAD))
            .ceil() as usize;
        let bucket_count = wanted.max(1).next_power_of_two();
        Self {
            buckets: vec![[EMPTY; SLOTS_PER_BUCKET]; bucket_count],
            bucket_mask: bucket_count - 1,
            fingerprint_bits,
            fingerprint_mask: (1u64 << fingerprint_bits) - 1,
            len: 0,
        }
    }

    /// Add a key. Returns false when the relocation chain exhausts and the
    /// filter is full; existing membership is left intact in that case.
    pub fn add(&mut self, key: &[u8]) -> bool {
        let (i1, fingerprint) = self.index_and_fingerprint(key);
        let i2 = self.alt_index(i1, fingerprint);

        if self.place(i1, fingerprint) || self.place(i2, fingerprint) {
            self.len += 1;
            return true;
        }

        // Relocate: kick a random occupant along its alternative chain,
        // remembering every displacement so a dead end can be undone.
        let mut rng = rand::rng();
        let mut index = if rng.random_range(0..2) == 0 { i1 } else { i2 };
        let mut current = fingerprint;
        let mut displaced: Vec<(usize, usize, u16)> = Vec::new();

        for _ in 0..MAX_KICKS {
            let slot = rng.random_range(0..SLOTS_PER_BUCKET);
            let evicted = self.buckets[index][slot];
            self.buckets[index][slot] = current;
            displaced.push((index, slot, evicted));
            current = evicted;
            index = self.alt_index(index, current);
            if self.place(index, current) {
                self.len += 1;
                return true;
            }
        }

        // Unwind the chain so membership is exactly what it was.
        while let Some((bucket, slot, previous)) = displaced.pop() {
            self.buckets[bucket][slot] = previous;
        }
        false
    }

    /// Whether the key may be present. False means definitely absent.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (i1, fingerprint) = self.index_and_fingerprint(key);
        if self.buckets[i1].contains(&fingerprint) {
            return true;
        }
        let i2 = self.alt_index(i1, fingerprint);
        self.buckets[i2].contains(&fingerprint)
    }

    /// Remove one copy of the key's fingerprint. Returns false when no
    /// matching fingerprint was found.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let (i1, fingerprint) = self.index_and_fingerprint(key);
        if self.clear_slot(i1, fingerprint) {
            self.len -= 1;
            return true;
        }
        let i2 = self.alt_index(i1, fingerprint);
        if self.clear_slot(i2, fingerprint) {
            self.len -= 1;
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len() * SLOTS_PER_BUCKET
    }

    /// Occupied fraction of all slots.
    pub fn load_factor(&self) -> f64 {
        self.len as f64 / self.capacity() as f64
    }

    /// Approximate heap footprint of the bucket array.
    pub fn memory_bytes(&self) -> usize {
        self.buckets.len() * SLOTS_PER_BUCKET * std::mem::size_of::<u16>()
    }

    pub fn fingerprint_bits(&self) -> u32 {
        self.fingerprint_bits
    }

    fn place(&mut self, index: usize, fingerprint: u16) -> bool {
        for slot in self.buckets[index].iter_mut() {
            if *slot == EMPTY {
                *slot = fingerprint;
                return true;
            }
        }
        false
    }

    fn clear_slot(&mut self, index: usize, fingerprint: u16) -> bool {
        for slot in self.buckets[index].iter_mut() {
            if *slot == fingerprint {
                *slot = EMPTY;
                return true;
            }
        }
        false
    }

    fn index_and_fingerprint(&self, key: &[u8]) -> (usize, u16) {
        let hash = hash64(key);
        // Fold the halves so the fingerprint is not correlated with the
        // bucket index bits; zero is reserved for empty slots.
        let folded = (hash >> 32) ^ hash;
        let mut fingerprint = (folded & self.fingerprint_mask) as u16;
        if fingerprint == EMPTY {
            fingerprint = 1;
        }
        ((hash as usize) & self.bucket_mask, fingerprint)
    }

    /// The partner bucket. Self-inverse: alt_index(alt_index(i, f), f) == i.
    fn alt_index(&self, index: usize, fingerprint: u16) -> usize {
        (index ^ (mix64(fingerprint as u64) as usize)) & self.bucket_mask
    }
}

fn derive_fingerprint_bits(fpp: f64) -> u32 {
    let fpp = fpp.clamp(1e-9, 0.5);
    let bits = (SLOTS_PER_BUCKET as f64 / fpp).log2().ceil() as u32;
    bits.clamp(4, 15)
}

fn hash64(key: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

// splitmix64 finalizer; the single canonical mixer for alternative indices.
fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = CuckooFilter::with_capacity(10_000, 0.001);
        for i in 0..10_000u32 {
            assert!(filter.add(format!("key-{i}").as_bytes()));
        }
        for i in 0..10_000u32 {
            assert!(filter.contains(format!("key-{i}").as_bytes()));
        }
    }

    #[test]
    fn test_delete_removes_membership() {
        let mut filter = CuckooFilter::with_capacity(100, 0.001);
        assert!(filter.add(b"session:1"));
        assert!(filter.contains(b"session:1"));
        assert!(filter.delete(b"session:1"));
        assert!(!filter.contains(b"session:1"));
        assert_eq!(filter.len(), 0);
    }

    #[test]
    fn test_delete_absent_returns_false() {
        let mut filter = CuckooFilter::with_capacity(100, 0.001);
        assert!(!filter.delete(b"never-added"));
    }

    #[test]
    fn test_alt_index_is_self_inverse() {
        let filter = CuckooFilter::with_capacity(1000, 0.001);
        for fingerprint in 1u16..100 {
            for index in [0usize, 1, 7, 63] {
                let alt = filter.alt_index(index & filter.bucket_mask, fingerprint);
                assert_eq!(
                    filter.alt_index(alt, fingerprint),
                    index & filter.bucket_mask
                );
            }
        }
    }

    #[test]
    fn test_fingerprint_bits_from_fpp() {
        // ceil(log2(4 / 0.001)) = 12
        assert_eq!(derive_fingerprint_bits(0.001), 12);
        assert_eq!(derive_fingerprint_bits(0.03), 8);
        // Clamped at the representable maximum.
        assert_eq!(derive_fingerprint_bits(1e-12), 15);
    }

    #[test]
    fn test_full_filter_reports_and_preserves_members() {
        // Tiny filter so the relocation chain actually dies.
        let mut filter = CuckooFilter::with_capacity(4, 0.001);
        let mut added = Vec::new();
        let mut full_seen = false;
        for i in 0..1000u32 {
            let key = format!("k{i}");
            if filter.add(key.as_bytes()) {
                added.push(key);
            } else {
                full_seen = true;
                break;
            }
        }
        assert!(full_seen, "filter never filled");
        // A failed add must leave every earlier key a member.
        for key in &added {
            assert!(filter.contains(key.as_bytes()));
        }
    }

    #[test]
    fn test_load_and_memory_reporting() {
        let mut filter = CuckooFilter::with_capacity(1000, 0.001);
        assert!(filter.memory_bytes() > 0);
        assert_eq!(filter.load_factor(), 0.0);
        for i in 0..100u32 {
            filter.add(format!("k{i}").as_bytes());
        }
        assert!(filter.load_factor() > 0.0);
        assert_eq!(filter.len(), 100);
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let mut filter = CuckooFilter::with_capacity(20_000, 0.001);
        for i in 0..20_000u32 {
            filter.add(format!("member-{i}").as_bytes());
        }
        let mut false_positives = 0usize;
        let probes = 100_000u32;
        for i in 0..probes {
            if filter.contains(format!("absent-{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / probes as f64;
        // 10x the configured target, the conventional slack for this size.
        assert!(rate <= 0.01, "false positive rate too high: {rate}");
    }
}
