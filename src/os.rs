//! The `PageMap` external collaborator: `map`/`unmap` of page-aligned,
//! zeroed anonymous memory, plus the small alignment helpers the rest of the
//! crate builds on.
//!
//! Mirrors `kiss/malloc/src/malloc.c`'s
//! `mmap(..., MAP_ANONYMOUS|MAP_PRIVATE|MAP_NORESERVE|MAP_POPULATE, -1, 0)`
//! call for the unix path, with a `VirtualAlloc`/`VirtualFree` equivalent for
//! Windows behind the same `cfg` split.

use crate::config::PAGE_SIZE;
use crate::stats::Stats;
use core::ptr::null_mut;
use log::warn;

#[cfg(not(windows))]
use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_NORESERVE, MAP_PRIVATE, MAP_FAILED, PROT_READ, PROT_WRITE};

#[cfg(windows)]
use winapi::{
    shared::minwindef::LPVOID,
    um::memoryapi::{VirtualAlloc, VirtualFree},
    um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
};

/// Rounds `size` up to a multiple of `align` (`align` must be a power of two).
#[inline]
pub fn align_up(size: usize, align: usize) -> usize {
    let mask = align - 1;
    (size + mask) & !mask
}

/// Rounds `size` down to a multiple of `align` (`align` must be a power of two).
#[inline]
pub fn align_down(size: usize, align: usize) -> usize {
    size & !(align - 1)
}

/// Maps `size` bytes (a multiple of `PAGE_SIZE`) of fresh, zeroed, `PAGE_SIZE`-aligned
/// memory from the OS. Returns `None` on failure; never returns a null, unaligned,
/// or undersized region on success.
pub fn map(size: usize, stats: &Stats) -> Option<usize> {
    debug_assert!(size > 0 && size % PAGE_SIZE == 0);
    stats.mmap_calls.increase(1);

    #[cfg(not(windows))]
    let addr = unsafe {
        let flags = MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE;
        let p = mmap(null_mut(), size, PROT_READ | PROT_WRITE, flags, -1, 0);
        if p == MAP_FAILED {
            null_mut()
        } else {
            p as *mut u8
        }
    };

    #[cfg(windows)]
    let addr = unsafe {
        VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) as *mut u8
    };

    if addr.is_null() {
        warn!("map failed: errno {}, size {}", errno::errno(), size);
        return None;
    }

    debug_assert_eq!(addr as usize % PAGE_SIZE, 0, "OS returned a misaligned mapping");
    stats.reserved.increase(size as i64);
    stats.committed.increase(size as i64);
    Some(addr as usize)
}

/// Unmaps `size` bytes at `addr` (both must have been produced by `map`, or be
/// a sub-run of one). Returns `false` on failure; callers must abort, per the
/// allocator's error-handling contract (kernel-side integrity failures are fatal).
#[must_use]
pub fn unmap(addr: usize, size: usize, stats: &Stats) -> bool {
    if addr == 0 || size == 0 {
        return true;
    }
    debug_assert_eq!(addr % PAGE_SIZE, 0);
    debug_assert_eq!(size % PAGE_SIZE, 0);

    #[cfg(not(windows))]
    let ok = unsafe { munmap(addr as *mut c_void, size) == 0 };

    #[cfg(windows)]
    let ok = unsafe { VirtualFree(addr as LPVOID, 0, MEM_RELEASE) != 0 };

    if ok {
        stats.committed.decrease(size as i64);
        stats.reserved.decrease(size as i64);
    } else {
        warn!("unmap failed: errno {}, addr {:#x}, size {}", errno::errno(), addr, size);
    }
    ok
}
