//! Tuning constants and the compile-time invariants that bind them together.
//!
//! Sized for a single flat page/run/cache design: one page size, one run
//! length, one cache capacity, one small-object granularity.

use core::mem::{align_of, size_of};

/// Size of one OS page. All `map`/`unmap` calls are multiples of this, and
/// every mapping returned by `os::map` is aligned to it.
pub const PAGE_SIZE: usize = 4096;

/// Threshold at which an allocation stops being served from a `Bucket` and is
/// instead mapped directly (see `alloc::dispatch_size_class`).
pub const LARGE_THRESHOLD: usize = PAGE_SIZE / 2;

/// Number of pages obtained per `PageRun` mapping.
pub const PAGES_PER_RUN: usize = 64;

/// Bytes reserved by one `PageRun` mapping.
pub const PREALLOC_SIZE: usize = PAGES_PER_RUN * PAGE_SIZE;

/// Maximum number of page addresses a `PageCache` can hold before it must
/// drain. Chosen so `size_of::<i32>() + CACHE_CAPACITY * size_of::<usize>() <= PAGE_SIZE`.
pub const CACHE_CAPACITY: usize = 255;

#[repr(align(16))]
struct MaxAlign(u128);

/// Minimum size and alignment for every small allocation: two machine words,
/// or the platform's maximum scalar alignment, whichever is larger.
pub const GRANULARITY: usize = {
    let two_words = 2 * size_of::<usize>();
    let max_align = align_of::<MaxAlign>();
    if two_words > max_align { two_words } else { max_align }
};

/// Rounds `x` up to the next multiple of the power-of-two `granularity`.
#[inline]
pub const fn round_up_pow2(x: usize, granularity: usize) -> usize {
    let mask = granularity - 1;
    (x + mask) & !mask
}

const fn is_pow2(x: usize) -> bool {
    x > 0 && (x & (x - 1)) == 0
}

const _GRANULARITY_IS_POW2: () = assert!(is_pow2(GRANULARITY), "GRANULARITY must be a power of two");
const _PAGE_SIZE_LIMIT: () = assert!(PAGE_SIZE <= 65536, "PAGE_SIZE above 64KiB is not supported");
const _CACHE_FITS_IN_PAGE: () = assert!(
    size_of::<i32>() + CACHE_CAPACITY * size_of::<usize>() <= PAGE_SIZE,
    "CACHE_CAPACITY entries do not fit in one PAGE_SIZE page"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_is_power_of_two_and_at_least_two_words() {
        assert!(is_pow2(GRANULARITY));
        assert!(GRANULARITY >= 2 * size_of::<usize>());
    }

    #[test]
    fn round_up_pow2_identity_on_multiples() {
        assert_eq!(round_up_pow2(0, GRANULARITY), 0);
        assert_eq!(round_up_pow2(GRANULARITY, GRANULARITY), GRANULARITY);
        assert_eq!(round_up_pow2(GRANULARITY * 3, GRANULARITY), GRANULARITY * 3);
    }

    #[test]
    fn round_up_pow2_rounds_up() {
        assert_eq!(round_up_pow2(1, GRANULARITY), GRANULARITY);
        assert_eq!(round_up_pow2(GRANULARITY + 1, GRANULARITY), GRANULARITY * 2);
    }

    #[test]
    fn large_threshold_is_half_a_page() {
        assert_eq!(LARGE_THRESHOLD, PAGE_SIZE / 2);
    }
}
