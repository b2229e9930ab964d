//! The per-thread `PageCache`: a bounded min-heap of retired page addresses,
//! kept address-ordered so that `drain` can coalesce adjacent pages into the
//! fewest possible `unmap` calls.
//!
//! Grounded on `kiss/malloc/src/cache.c` (`cache_bubble_up`/`cache_bubble_down`/
//! `cache_pop`/`cache_reduce`/`cache_push`) for the heap algorithm, kept to a
//! heavily `debug_assert!`-ed style for its own page bookkeeping.
//!
//! Addresses are kept as `usize` rather than typed pointers throughout: this
//! lets the heap logic be exercised by plain unit tests with made-up
//! addresses, with no live OS mapping required.

use crate::config::CACHE_CAPACITY;

/// One page's worth of retired-address bookkeeping. In production this struct
/// is placed at offset 0 of a freshly mapped page (see `BucketHeader`'s
/// `cache_ptr`); in tests it can live anywhere, since every operation here is
/// pure pointer-free bookkeeping over `usize` values.
#[repr(C)]
pub struct PageCache {
    fill: i32,
    entries: [usize; CACHE_CAPACITY],
}

impl PageCache {
    /// An empty cache, as produced by a freshly mapped (zeroed) page.
    pub const EMPTY: PageCache = PageCache {
        fill: 0,
        entries: [0; CACHE_CAPACITY],
    };

    #[inline]
    pub fn fill(&self) -> usize {
        self.fill as usize
    }

    #[inline]
    fn parent(i: usize) -> usize {
        (i - 1) >> 1
    }

    #[inline]
    fn left(i: usize) -> usize {
        (i << 1) + 1
    }

    #[inline]
    fn right(i: usize) -> usize {
        (i << 1) + 2
    }

    fn sift_up(&mut self) {
        let mut i = self.fill() - 1;
        while i > 0 {
            let j = Self::parent(i);
            if self.entries[i] >= self.entries[j] {
                break;
            }
            self.entries.swap(i, j);
            i = j;
        }
    }

    fn sift_down(&mut self) {
        let fill = self.fill();
        let mut i = 0;
        loop {
            let l = Self::left(i);
            let r = Self::right(i);
            if r < fill {
                let mut m = i;
                if self.entries[l] < self.entries[m] {
                    m = l;
                }
                if self.entries[r] < self.entries[m] {
                    m = r;
                }
                if m == i {
                    break;
                }
                self.entries.swap(i, m);
                i = m;
            } else if l < fill {
                if self.entries[l] < self.entries[i] {
                    self.entries.swap(i, l);
                }
                break;
            } else {
                break;
            }
        }
    }

    fn pop(&mut self) -> usize {
        debug_assert!(self.fill() > 0);
        let top = self.entries[0];
        self.fill -= 1;
        self.entries[0] = self.entries[self.fill()];
        self.sift_down();
        top
    }

    /// Inserts `page` into the cache, draining to half capacity first if the
    /// cache is already full.
    pub fn push(&mut self, page: usize, drain_unmap: &mut dyn FnMut(usize, usize)) {
        if self.fill() == CACHE_CAPACITY {
            self.drain(CACHE_CAPACITY / 2, drain_unmap);
        }
        self.entries[self.fill()] = page;
        self.fill += 1;
        self.sift_up();
    }

    /// Pops entries down to `target_fill`, coalescing address-adjacent pages
    /// into runs and invoking `unmap(addr, size)` once per run. `page_size`
    /// must be the size of one entry's page (`config::PAGE_SIZE` in
    /// production).
    pub fn drain(&mut self, target_fill: usize, unmap: &mut dyn FnMut(usize, usize)) {
        self.drain_with_page_size(target_fill, crate::config::PAGE_SIZE, unmap);
    }

    /// Like `drain`, but with an explicit page size — used by tests that work
    /// in small made-up address units instead of real `PAGE_SIZE`.
    pub fn drain_with_page_size(&mut self, target_fill: usize, page_size: usize, unmap: &mut dyn FnMut(usize, usize)) {
        if self.fill() <= target_fill {
            return;
        }
        let mut run_start = self.pop();
        let mut run_size = page_size;
        while self.fill() > target_fill {
            let next = self.pop();
            if next.wrapping_sub(run_start) == run_size {
                run_size += page_size;
            } else {
                unmap(run_start, run_size);
                run_start = next;
                run_size = page_size;
            }
        }
        unmap(run_start, run_size);
    }

    /// Returns a copy of the live entries in heap-array order, for testing
    /// the heap invariant.
    #[cfg(test)]
    pub fn entries(&self) -> &[usize] {
        &self.entries[..self.fill()]
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::EMPTY
    }
}
