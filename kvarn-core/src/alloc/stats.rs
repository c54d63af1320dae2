//! ## kvarn-core::alloc::stats
//! **Per-pool allocation statistics**
//!
//! Relaxed atomic counters, bumped on the alloc/free paths and read as a
//! point-in-time [`PoolStatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PoolStats {
    allocs: AtomicU64,
    frees: AtomicU64,
    empty: AtomicU64,
    rejected: AtomicU64,
    low_wm: AtomicU64,
    high_wm: AtomicU64,
}

/// Copy of the counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Successful allocations.
    pub allocs: u64,
    /// Successful frees.
    pub frees: u64,
    /// Allocations that found the pool exhausted.
    pub empty: u64,
    /// Allocations larger than the pool can serve.
    pub rejected: u64,
    /// Times the free count crossed down to the low watermark.
    pub low_wm: u64,
    /// Times the free count recovered to the high watermark.
    pub high_wm: u64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment_allocs(&self) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_frees(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_empty(&self) {
        self.empty.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_low_wm(&self) {
        self.low_wm.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_high_wm(&self) {
        self.high_wm.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            low_wm: self.low_wm.load(Ordering::Relaxed),
            high_wm: self.high_wm.load(Ordering::Relaxed),
        }
    }
}
