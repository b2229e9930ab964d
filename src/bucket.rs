//! `BucketHeader` and the per-thread bump-allocation frontier it anchors.
//!
//! Field order follows `kissmalloc`'s `bucket_t`: hot fields the bump path
//! touches on every call (`bytes_dirty`, `object_count`) come before the
//! rarely-read `cache_ptr`, kept `#[repr(C)]` to fix the 16-byte layout.
//!
//! A thread's current bucket is not a separate heap object: it *is* the
//! `BucketHeader` living at offset 0 of the active page, exactly as in the
//! original C (`bucket_t *bucket = pthread_getspecific(bucket_key)`). Callers
//! (`thread_env`, `alloc`) hold only the page's address.

use crate::cache::PageCache;
use crate::config::{round_up_pow2, GRANULARITY, PAGES_PER_RUN, PAGE_SIZE, PREALLOC_SIZE};
use crate::os;
use crate::stats::Stats;
use core::mem::size_of;
use core::sync::atomic::{AtomicU16, Ordering};

/// Sentinel meaning "this thread has no active bucket page yet".
pub const NO_PAGE: usize = 0;

/// Byte offset into a page at which the first user object starts, once the
/// header itself has been rounded up to `GRANULARITY`.
pub const HEADER_SIZE: usize = round_up_pow2(size_of::<BucketHeader>(), GRANULARITY);

/// The 16-byte header living at offset 0 of every active or retired bucket
/// page.
#[repr(C)]
pub struct BucketHeader {
    /// Pages remaining, unused, immediately after this one in the current run.
    pub prealloc_remaining: u16,
    /// Unused by semantics; present only to keep the header 16 bytes.
    reserved_checksum: u16,
    /// Bump cursor: next free byte offset in this page.
    pub bytes_dirty: u16,
    /// Live-object count, plus one while this page is the active bump frontier.
    /// The only field ever touched by a thread other than the page's owner.
    pub object_count: AtomicU16,
    /// The owning thread's page cache.
    pub cache_ptr: *mut PageCache,
}

const _HEADER_IS_16_BYTES: () = assert!(size_of::<BucketHeader>() == 16, "BucketHeader must be exactly 16 bytes");

impl BucketHeader {
    /// # Safety
    /// `page` must be the address of a live, initialized bucket page.
    #[inline]
    unsafe fn at<'a>(page: usize) -> &'a BucketHeader {
        &*(page as *const BucketHeader)
    }

    /// # Safety
    /// `page` must be the address of a live, initialized bucket page, and the
    /// caller must be the page's current owning thread (only `bytes_dirty`,
    /// `prealloc_remaining` and `cache_ptr` are thread-owned; `object_count`
    /// is safe to touch from any thread via its atomic methods).
    #[inline]
    unsafe fn at_mut<'a>(page: usize) -> &'a mut BucketHeader {
        &mut *(page as *mut BucketHeader)
    }
}

/// Logs and aborts on an `unmap` failure: the allocator believed it owned
/// that region, so a refusal means kernel-state corruption.
fn unmap_or_abort(addr: usize, size: usize, stats: &Stats) {
    if !os::unmap(addr, size, stats) {
        log::error!("unmap refused an address this allocator believes it owns; aborting");
        unsafe { libc::abort() };
    }
}

/// Pushes `page` into `*cache_ptr`, draining coalesced runs as needed. Shared
/// by bucket retirement and `alloc::free`'s cross-thread hand-off.
pub fn push_page_into_cache(cache_ptr: *mut PageCache, page: usize, stats: &Stats) {
    debug_assert!(!cache_ptr.is_null());
    stats.pages_retired.increase(1);
    unsafe {
        (*cache_ptr).push(page, &mut |addr, size| {
            stats.cache_unmaps.increase(1);
            stats.drain_run_pages.record((size / PAGE_SIZE) as i64);
            unmap_or_abort(addr, size, stats);
        });
    }
}

/// Rounds `size` up to `GRANULARITY` and either bumps the
/// current page or retires it and replenishes. `current_page` is the
/// thread-local bucket slot (0 meaning none); updated in place. Returns
/// `None` only when a fresh `map` was required and failed.
pub fn alloc_small(current_page: &mut usize, size: usize, stats: &Stats) -> Option<usize> {
    let size = round_up_pow2(size.max(1), GRANULARITY);

    if *current_page != NO_PAGE {
        let header = unsafe { BucketHeader::at(*current_page) };
        let bytes_dirty = header.bytes_dirty as usize;
        if size <= PAGE_SIZE - bytes_dirty {
            let data = *current_page + bytes_dirty;
            unsafe {
                BucketHeader::at_mut(*current_page).bytes_dirty = (bytes_dirty + size) as u16;
            }
            header.object_count.fetch_add(1, Ordering::AcqRel);
            return Some(data);
        }
    }

    retire_and_replenish(current_page, size, stats)
}

/// Retires the outgoing page and replenishes from the run or a fresh `map`.
fn retire_and_replenish(current_page: &mut usize, size: usize, stats: &Stats) -> Option<usize> {
    let outgoing = *current_page;

    let mut prealloc_remaining = 0u16;
    let mut cache_ptr: *mut PageCache = core::ptr::null_mut();

    if outgoing != NO_PAGE {
        let header = unsafe { BucketHeader::at(outgoing) };
        prealloc_remaining = header.prealloc_remaining;
        cache_ptr = header.cache_ptr;
        if header.object_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            push_page_into_cache(cache_ptr, outgoing, stats);
        }
    }

    let (new_page, new_prealloc_remaining) = if prealloc_remaining > 0 {
        (outgoing + PAGE_SIZE, prealloc_remaining - 1)
    } else {
        let run = os::map(PREALLOC_SIZE, stats)?;
        stats.page_runs.increase(1);
        (run, (PAGES_PER_RUN - 1) as u16)
    };

    let cache_ptr = if cache_ptr.is_null() {
        os::map(PAGE_SIZE, stats)? as *mut PageCache
    } else {
        cache_ptr
    };

    unsafe {
        let header = BucketHeader::at_mut(new_page);
        header.prealloc_remaining = new_prealloc_remaining;
        header.reserved_checksum = 0;
        header.bytes_dirty = (HEADER_SIZE + size) as u16;
        header.object_count = AtomicU16::new(2);
        header.cache_ptr = cache_ptr;
    }

    if outgoing == NO_PAGE {
        // This thread has never held a bucket page before now, and the
        // replenishment above succeeded, so it is now live.
        stats.threads.increase(1);
    }
    *current_page = new_page;
    Some(new_page + HEADER_SIZE)
}

/// Installs a brand-new, empty bucket page for a thread that has never
/// allocated but needs somewhere to push a page it is freeing on another
/// thread's behalf.
pub fn create_empty(stats: &Stats) -> Option<usize> {
    let run = os::map(PREALLOC_SIZE, stats)?;
    stats.page_runs.increase(1);
    let cache_ptr = os::map(PAGE_SIZE, stats)? as *mut PageCache;
    unsafe {
        let header = BucketHeader::at_mut(run);
        header.prealloc_remaining = (PAGES_PER_RUN - 1) as u16;
        header.reserved_checksum = 0;
        header.bytes_dirty = HEADER_SIZE as u16;
        header.object_count = AtomicU16::new(1);
        header.cache_ptr = cache_ptr;
    }
    stats.threads.increase(1);
    Some(run)
}

/// Thread-exit cleanup: drains and unmaps the cache, then unmaps the
/// run this bucket was the head of, leaking the first page if objects on it
/// are still reachable from another thread.
pub fn thread_exit_cleanup(page: usize, stats: &Stats) {
    stats.threads.decrease(1);
    let header = unsafe { BucketHeader::at(page) };
    let cache_ptr = header.cache_ptr;
    let prealloc_remaining = header.prealloc_remaining;

    unsafe {
        (*cache_ptr).drain(0, &mut |addr, size| unmap_or_abort(addr, size, stats));
    }
    unmap_or_abort(cache_ptr as usize, PAGE_SIZE, stats);

    let mut size = (prealloc_remaining as usize + 1) * PAGE_SIZE;
    let remaining = header.object_count.fetch_sub(1, Ordering::AcqRel) - 1;

    let unmap_head = if remaining != 0 {
        log::debug!("thread exit: {} objects still reachable on bucket head page, leaking it", remaining);
        size -= PAGE_SIZE;
        page + PAGE_SIZE
    } else {
        page
    };
    if size > 0 {
        unmap_or_abort(unmap_head, size, stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_spec() {
        assert_eq!(size_of::<BucketHeader>(), 16);
    }

    #[test]
    fn header_offset_is_granularity_aligned_and_leaves_room_for_a_small_object() {
        assert_eq!(HEADER_SIZE % GRANULARITY, 0);
        assert!(HEADER_SIZE >= size_of::<BucketHeader>());
        assert!(HEADER_SIZE < PAGE_SIZE);
    }

    #[test]
    fn alloc_small_on_a_real_page_bumps_the_cursor() {
        let stats = Stats::default();
        let mut current = NO_PAGE;
        let p1 = alloc_small(&mut current, 24, &stats).expect("first alloc_small should succeed");
        let page_after_first = current;
        assert_ne!(page_after_first, NO_PAGE);
        assert_eq!(p1 % PAGE_SIZE != 0, true);

        let p2 = alloc_small(&mut current, 24, &stats).expect("second alloc_small should succeed");
        // Same page: the bucket was not retired, bump cursor advanced.
        assert_eq!(current, page_after_first);
        assert!(p2 > p1);
        assert_eq!(p2 - p1, round_up_pow2(24, GRANULARITY));

        // Clean up the mapping so the test does not leak.
        let header = unsafe { BucketHeader::at(current) };
        let prealloc_remaining = header.prealloc_remaining;
        let run_base = current;
        let run_size = (prealloc_remaining as usize + 1) * PAGE_SIZE;
        assert!(os::unmap(run_base, run_size, &stats));
        assert!(os::unmap(header.cache_ptr as usize, PAGE_SIZE, &stats));
    }
}
