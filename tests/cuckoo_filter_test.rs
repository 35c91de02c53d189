// Cuckoo filter properties at realistic scale: no false negatives and a
// bounded false positive rate for the configured target.

use hypercache::filter::CuckooFilter;

#[test]
fn test_false_positive_rate_within_ten_times_target() {
    // fpp target 0.001 derives 12-bit fingerprints with 4-slot buckets.
    let members = 100_000u32;
    let probes = 1_000_000u32;
    let mut filter = CuckooFilter::with_capacity(members as usize, 0.001);
    assert_eq!(filter.fingerprint_bits(), 12);

    for i in 0..members {
        assert!(
            filter.add(format!("member:{i}").as_bytes()),
            "add failed at {i} with load {}",
            filter.load_factor()
        );
    }

    // No false negatives, ever.
    for i in (0..members).step_by(97) {
        assert!(filter.contains(format!("member:{i}").as_bytes()));
    }

    // Disjoint key space for the probe set.
    let mut false_positives = 0u32;
    for i in 0..probes {
        if filter.contains(format!("absent:{i}").as_bytes()) {
            false_positives += 1;
        }
    }
    let rate = false_positives as f64 / probes as f64;
    assert!(
        rate <= 0.005,
        "false positive rate {rate} above 10x the 0.001 target bound"
    );
}

#[test]
fn test_deletion_restores_false_positive_budget() {
    let mut filter = CuckooFilter::with_capacity(10_000, 0.001);
    for i in 0..10_000u32 {
        filter.add(format!("k{i}").as_bytes());
    }
    for i in 0..10_000u32 {
        assert!(filter.delete(format!("k{i}").as_bytes()));
    }
    assert_eq!(filter.len(), 0);
    // With everything deleted the filter should reject nearly all probes.
    let mut hits = 0;
    for i in 0..10_000u32 {
        if filter.contains(format!("k{i}").as_bytes()) {
            hits += 1;
        }
    }
    assert_eq!(hits, 0, "deleted keys still reported present");
}

#[test]
fn test_high_load_add_failure_is_clean() {
    let mut filter = CuckooFilter::with_capacity(64, 0.001);
    let mut inserted = Vec::new();
    for i in 0..100_000u32 {
        let key = format!("k{i}");
        if filter.add(key.as_bytes()) {
            inserted.push(key);
        } else {
            break;
        }
    }
    assert!(
        filter.load_factor() > 0.9,
        "filter gave up at load {}",
        filter.load_factor()
    );
    // A failed add must leave prior membership intact.
    for key in &inserted {
        assert!(filter.contains(key.as_bytes()));
    }
}
