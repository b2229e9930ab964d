//! Process-wide allocator statistics.
//!
//! `StatCount`/`StatCounter` track a running current/peak value and a
//! running total/count respectively, each updated without a lock; `Stats`
//! aggregates one of each per resource this allocator actually produces
//! (page runs, retired pages, cache drains, live threads).

use core::sync::atomic::{AtomicI64, Ordering};

/// A counter that additionally tracks the high-water mark it has reached.
#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    const fn new() -> Self {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }

    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }
}

/// A simple running total plus an observation count (used for `searches`-style
/// stats where the average matters more than the current value).
#[derive(Default)]
pub struct StatCounter {
    pub total: AtomicI64,
    pub count: AtomicI64,
}

impl StatCounter {
    const fn new() -> Self {
        StatCounter {
            total: AtomicI64::new(0),
            count: AtomicI64::new(0),
        }
    }

    pub fn record(&self, value: i64) {
        self.total.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide counters. One instance is shared by every thread; all updates
/// go through the atomic operations above, never a lock.
#[derive(Default)]
pub struct Stats {
    /// Bytes reserved from the OS (page runs, cache pages, large allocations).
    pub reserved: StatCount,
    /// Bytes currently committed (identical to `reserved` on this design,
    /// since nothing is ever decommitted without being unmapped outright).
    pub committed: StatCount,
    /// Number of `PageRun`s mapped.
    pub page_runs: StatCount,
    /// Number of bucket pages retired into a cache.
    pub pages_retired: StatCount,
    /// Number of large allocations currently live.
    pub large_allocations: StatCount,
    /// Number of live threads that have touched the allocator.
    pub threads: StatCount,
    /// Total number of `map` syscalls issued.
    pub mmap_calls: StatCount,
    /// Total number of `unmap` syscalls issued by cache drains.
    pub cache_unmaps: StatCount,
    /// Size, in pages, of each run unmapped by a cache drain (for measuring
    /// coalescing effectiveness).
    pub drain_run_pages: StatCounter,
}

impl Stats {
    /// A zeroed counter set, usable in a `static` initializer (the global
    /// allocator cannot rely on lazy-initialized statics, since those would
    /// themselves need to allocate on first touch on some platforms).
    pub const fn new() -> Self {
        Stats {
            reserved: StatCount::new(),
            committed: StatCount::new(),
            page_runs: StatCount::new(),
            pages_retired: StatCount::new(),
            large_allocations: StatCount::new(),
            threads: StatCount::new(),
            mmap_calls: StatCount::new(),
            cache_unmaps: StatCount::new(),
            drain_run_pages: StatCounter::new(),
        }
    }
}

/// A point-in-time, non-atomic copy of the counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub reserved_bytes: i64,
    pub committed_bytes: i64,
    pub page_runs: i64,
    pub pages_retired: i64,
    pub large_allocations: i64,
    pub threads: i64,
    pub mmap_calls: i64,
    pub cache_unmaps: i64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reserved_bytes: self.reserved.current.load(Ordering::Relaxed),
            committed_bytes: self.committed.current.load(Ordering::Relaxed),
            page_runs: self.page_runs.current.load(Ordering::Relaxed),
            pages_retired: self.pages_retired.allocated.load(Ordering::Relaxed),
            large_allocations: self.large_allocations.current.load(Ordering::Relaxed),
            threads: self.threads.current.load(Ordering::Relaxed),
            mmap_calls: self.mmap_calls.allocated.load(Ordering::Relaxed),
            cache_unmaps: self.cache_unmaps.allocated.load(Ordering::Relaxed),
        }
    }
}
