//! Pool activity counters.
//!
//! Mirrors the teacher GC allocator's own stats module: a set of atomics
//! updated on the hot path, collapsed into a plain `Copy` snapshot struct on
//! read so a caller never observes a half-updated value and never blocks an
//! allocation just to read a counter.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    allocations: AtomicU64,
    frees: AtomicU64,
    pages_grown: AtomicU64,
    pages_reclaimed: AtomicU64,
    peak_pages: AtomicU64,
}

impl Metrics {
    pub(crate) fn record_alloc(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self, page_reclaimed: bool) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        if page_reclaimed {
            self.pages_reclaimed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_grow(&self, total_pages_after: u64) {
        self.pages_grown.fetch_add(1, Ordering::Relaxed);
        self.peak_pages.fetch_max(total_pages_after, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            pages_grown: self.pages_grown.load(Ordering::Relaxed),
            pages_reclaimed: self.pages_reclaimed.load(Ordering::Relaxed),
            peak_pages: self.peak_pages.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of a pool's lifetime activity counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total successful `allocate` calls.
    pub allocations: u64,
    /// Total `free` calls.
    pub frees: u64,
    /// Number of pages acquired from the page source.
    pub pages_grown: u64,
    /// Number of pages returned to the page source after their last block
    /// was freed.
    pub pages_reclaimed: u64,
    /// The highest `total_pages` the pool has held at once.
    pub peak_pages: u64,
}
