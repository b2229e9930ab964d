#![cfg_attr(not(test), no_std)]
//! A per-thread bump-bucket allocator with an address-coalescing page cache,
//! ported from Frank Mertens's `kissmalloc`. See `DESIGN.md` for where each
//! piece of this crate came from.
//!
//! The safe entry point is [`KissAllocator`] (a [`core::alloc::GlobalAlloc`]
//! impl) or [`Allocator`] directly for the `malloc`/`free`/... primitives
//! without going through `Layout`. With the default `c-abi` feature, the
//! crate also exports `malloc`/`free`/`calloc`/`realloc`/`posix_memalign`/
//! `aligned_alloc`/`memalign`/`valloc`/`pvalloc` as `#[no_mangle] extern "C"`
//! symbols, so it can be `LD_PRELOAD`ed or linked as a `staticlib` in place of
//! the system allocator.

mod alloc;
mod bucket;
mod cache;
mod config;
mod error;
mod os;
mod stats;
mod thread_env;

#[cfg(feature = "c-abi")]
mod ffi;

pub use crate::alloc::{Allocator, KissAllocator, GLOBAL};
pub use crate::error::AllocError;
pub use crate::stats::StatsSnapshot;

/// The single process-wide statistics singleton. `Stats::new()` is `const`
/// specifically so this can be a plain `static`: the allocator must not
/// depend on a lazily-initialized static (`lazy_static`/`once_cell`'s
/// standard implementations allocate on first touch on some platforms, which
/// would make the global allocator reentrant on its own bootstrap).
pub(crate) static GLOBAL_STATS: stats::Stats = stats::Stats::new();

/// Returns a snapshot of the process-wide allocator statistics.
pub fn stats() -> StatsSnapshot {
    GLOBAL_STATS.snapshot()
}
