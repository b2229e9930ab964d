//! The `Allocator` dispatch surface: routes each request across the small /
//! large / aligned regimes, and implements
//! `calloc`/`realloc`/`posix_memalign` on top of `malloc`/`free`.
//!
//! Grounded on `kiss/malloc/src/malloc.c`'s `malloc`/`free`/`calloc`/
//! `realloc`/`posix_memalign` bodies for the algorithm.

use crate::bucket::{self, BucketHeader, NO_PAGE};
use crate::cache::PageCache;
use crate::config::{round_up_pow2, GRANULARITY, LARGE_THRESHOLD, PAGE_SIZE};
use crate::error::AllocError;
use crate::os;
use crate::stats::{Stats, StatsSnapshot};
use crate::thread_env;
use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::sync::atomic::Ordering;
use log::trace;

/// Size of the size-carrying prefix page placed before every large
/// allocation's body (the large allocation's size-carrying prefix page).
const LARGE_PREFIX: usize = PAGE_SIZE;

/// The allocator proper: owns no state of its own. Every call forwards to the
/// single process-wide `crate::GLOBAL_STATS` singleton (also the destination
/// the TLS destructor in `thread_env` reports into on thread exit, so there
/// must be exactly one). Per-thread state lives in `thread_env`; this type
/// exists so the crate has a single place to hang the public, safe-Rust API
/// and the `GlobalAlloc` impl.
pub struct Allocator {
    _private: (),
}

impl Allocator {
    pub const fn new() -> Self {
        Allocator { _private: () }
    }

    fn stats(&self) -> &'static Stats {
        &crate::GLOBAL_STATS
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats().snapshot()
    }

    /// `malloc`. `size == 0` is treated as `size == 1`, so it always returns a
    /// unique, non-null pointer from the small path.
    pub fn malloc(&self, size: usize) -> Result<usize, AllocError> {
        let size = size.max(1);
        if size < LARGE_THRESHOLD {
            thread_env::with_current(
                |current, stats| bucket::alloc_small(current, size, stats).ok_or(AllocError::OutOfMemory),
                self.stats(),
            )
        } else {
            self.malloc_large(size)
        }
    }

    fn malloc_large(&self, size: usize) -> Result<usize, AllocError> {
        let mapped = round_up_pow2(size, PAGE_SIZE) + LARGE_PREFIX;
        let head = os::map(mapped, self.stats()).ok_or(AllocError::OutOfMemory)?;
        unsafe {
            *(head as *mut usize) = mapped;
        }
        self.stats().large_allocations.increase(1);
        trace!("malloc_large: {} bytes at {:#x} (mapped {})", size, head + LARGE_PREFIX, mapped);
        Ok(head + LARGE_PREFIX)
    }

    /// `free`. No-op on a null pointer; undefined behavior on a foreign or
    /// already-freed pointer, per contract.
    pub fn free(&self, ptr: usize) {
        if ptr == 0 {
            return;
        }
        if ptr % PAGE_SIZE != 0 {
            self.free_small(ptr);
        } else {
            self.free_large(ptr);
        }
    }

    fn free_small(&self, ptr: usize) {
        let page = os::align_down(ptr, PAGE_SIZE);
        let header = unsafe { &*(page as *const BucketHeader) };
        if header.object_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            // We observed the transition to zero: this page is now ours to
            // reclaim, localized to *this* (the freeing) thread's cache.
            let cache_ptr = thread_env::with_current(
                |current, stats| -> *mut PageCache {
                    if *current == NO_PAGE {
                        match bucket::create_empty(stats) {
                            Some(page) => *current = page,
                            None => {
                                log::error!("out of memory creating a bucket while freeing cross-thread; aborting");
                                unsafe { libc::abort() };
                            }
                        }
                    }
                    let my_header = unsafe { &*(*current as *const BucketHeader) };
                    my_header.cache_ptr
                },
                self.stats(),
            );
            bucket::push_page_into_cache(cache_ptr, page, self.stats());
        }
    }

    fn free_large(&self, ptr: usize) {
        let head = ptr - LARGE_PREFIX;
        let mapped = unsafe { *(head as *const usize) };
        if !os::unmap(head, mapped, self.stats()) {
            log::error!("unmap refused a large allocation this allocator believes it owns; aborting");
            unsafe { libc::abort() };
        }
        self.stats().large_allocations.decrease(1);
    }

    /// `calloc`. Checks `n * size` for overflow (`ENOMEM` on overflow, a
    /// deliberate hardening over the original's unchecked multiply) and
    /// always explicitly zeroes the result, since a recycled small-object
    /// slot cannot be proven untouched.
    pub fn calloc(&self, n: usize, size: usize) -> Result<usize, AllocError> {
        let total = n.checked_mul(size).ok_or(AllocError::OutOfMemory)?;
        let ptr = self.malloc(total)?;
        unsafe {
            core::ptr::write_bytes(ptr as *mut u8, 0, total.max(1));
        }
        Ok(ptr)
    }

    /// `realloc`.
    pub fn realloc(&self, ptr: usize, size: usize) -> Result<usize, AllocError> {
        if ptr == 0 {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return Ok(0);
        }
        if size <= GRANULARITY {
            return Ok(ptr);
        }

        let copy_size = self.realloc_copy_size_estimate(ptr, size);
        let new_ptr = self.malloc(size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, copy_size);
        }
        self.free(ptr);
        Ok(new_ptr)
    }

    /// The conservative copy-size estimate: for a
    /// small original, the smaller of "bytes used from `ptr` to the bump
    /// cursor" and "bytes used per the live-object count", both clamped to
    /// the requested `size`; for a large original, a full page (the true
    /// size is recorded but reading another thread's page across a realloc
    /// boundary without synchronization is the behavior this crate keeps
    /// unchanged from the original, per the Open Questions resolution).
    fn realloc_copy_size_estimate(&self, ptr: usize, size: usize) -> usize {
        let offset = ptr % PAGE_SIZE;
        let copy_size = if offset > 0 {
            let page = ptr - offset;
            let header = unsafe { &*(page as *const BucketHeader) };
            let bytes_dirty = header.bytes_dirty as usize;
            let object_count = header.object_count.load(Ordering::Acquire) as usize;
            let estimate_from_cursor = bytes_dirty.saturating_sub(offset);
            let estimate_from_count = bytes_dirty.saturating_sub((object_count.saturating_sub(1)) * GRANULARITY);
            estimate_from_cursor.min(estimate_from_count)
        } else {
            PAGE_SIZE
        };
        copy_size.min(size)
    }

    /// `posix_memalign`.
    pub fn posix_memalign(&self, alignment: usize, size: usize) -> Result<Option<usize>, AllocError> {
        if size == 0 {
            return Ok(None);
        }
        let pow2 = alignment > 0 && (alignment & (alignment - 1)) == 0;
        if !pow2 || alignment % size_of::<*const ()>() != 0 {
            return Err(AllocError::InvalidAlignment);
        }
        if alignment <= GRANULARITY {
            return self.malloc(size).map(Some);
        }
        if alignment + size < LARGE_THRESHOLD {
            let raw = self.malloc(alignment + size)?;
            let aligned = round_up_pow2(raw, alignment);
            return Ok(Some(aligned));
        }

        let mapped = os::align_up(size + alignment + LARGE_PREFIX, PAGE_SIZE);
        let mut head = os::map(mapped, self.stats()).ok_or(AllocError::OutOfMemory)?;
        let mut remaining = mapped;
        while (head + LARGE_PREFIX) % alignment != 0 {
            if !os::unmap(head, PAGE_SIZE, self.stats()) {
                log::error!("unmap refused a leading alignment page; aborting");
                unsafe { libc::abort() };
            }
            head += PAGE_SIZE;
            remaining -= PAGE_SIZE;
        }
        unsafe {
            *(head as *mut usize) = remaining;
        }
        self.stats().large_allocations.increase(1);
        Ok(Some(head + LARGE_PREFIX))
    }

    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> Result<usize, AllocError> {
        Ok(self.posix_memalign(alignment, size)?.unwrap_or(0))
    }

    pub fn valloc(&self, size: usize) -> Result<usize, AllocError> {
        self.malloc(round_up_pow2(size, PAGE_SIZE))
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

/// `GlobalAlloc` wrapper over [`GLOBAL`]. `Layout::align()` beyond `GRANULARITY` is routed
/// through `posix_memalign`; everything else goes through `malloc`/`free`.
pub struct KissAllocator;

unsafe impl GlobalAlloc for KissAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = if layout.align() <= GRANULARITY {
            GLOBAL.malloc(layout.size())
        } else {
            GLOBAL.posix_memalign(layout.align(), layout.size()).map(|p| p.unwrap_or(0))
        };
        result.map(|p| p as *mut u8).unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        GLOBAL.free(ptr as usize);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }
}

/// The single process-wide allocator instance backing both the `GlobalAlloc`
/// impl and the C ABI shim in `ffi`.
pub static GLOBAL: Allocator = Allocator::new();
