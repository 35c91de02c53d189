// # Memory Pool
//
// Budgeted byte accounting for a single store. The pool tracks a running
// usage counter against a fixed maximum and reports pressure so the store
// knows when to start evicting. It does not hand out buffers or track
// individual allocations beyond their length; the store owns the bytes and
// releases exactly what it reserved.
//
// All operations are O(1) and lock-free.

use crate::error::{CacheError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Pressure ratio above which the owning store should evict.
pub const DEFAULT_EVICTION_THRESHOLD: f64 = 0.8;

pub struct MemoryPool {
    max_bytes: u64,
    used: AtomicU64,
    eviction_threshold: f64,
}

impl MemoryPool {
    pub fn new(max_bytes: u64) -> Self {
        Self::with_threshold(max_bytes, DEFAULT_EVICTION_THRESHOLD)
    }

    pub fn with_threshold(max_bytes: u64, eviction_threshold: f64) -> Self {
        Self {
            max_bytes,
            used: AtomicU64::new(0),
            eviction_threshold,
        }
    }

    /// Reserve `n` bytes. Fails without changing usage when the budget
    /// cannot cover the request.
    pub fn reserve(&self, n: u64) -> Result<()> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let available = self.max_bytes.saturating_sub(current);
            if n > available {
                return Err(CacheError::BudgetExceeded {
                    needed: n,
                    available,
                });
            }
            match self.used.compare_exchange_weak(
                current,
                current + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Return `n` previously reserved bytes to the pool.
    pub fn release(&self, n: u64) {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(n);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u64 {
        self.max_bytes
    }

    pub fn available(&self) -> u64 {
        self.max_bytes.saturating_sub(self.used())
    }

    /// Usage ratio in [0, 1].
    pub fn pressure(&self) -> f64 {
        if self.max_bytes == 0 {
            return 1.0;
        }
        self.used() as f64 / self.max_bytes as f64
    }

    /// True once pressure crosses the eviction threshold.
    pub fn needs_eviction(&self) -> bool {
        self.pressure() > self.eviction_threshold
    }
}
