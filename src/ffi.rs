//! The C ABI surface: `#[no_mangle] extern "C"` exports matching
//! `kiss/malloc/src/include/kiss/malloc.h`, so this crate can stand in for
//! the system allocator when built as a `staticlib`. Gated behind the
//! `c-abi` feature so a pure-Rust consumer pulling in `KissAllocator`
//! directly does not also get a set of colliding `malloc`/`free` symbols.
//!
//! Every function here does nothing but translate between C calling
//! convention and `crate::alloc::GLOBAL`: argument/return marshalling and
//! `errno` reporting live here, never allocator logic.

use crate::alloc::GLOBAL;
use crate::error::AllocError;
use libc::{c_int, c_void, size_t};

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    match GLOBAL.malloc(size) {
        Ok(ptr) => ptr as *mut c_void,
        Err(err) => {
            err.set_errno();
            core::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    GLOBAL.free(ptr as usize);
}

#[no_mangle]
pub unsafe extern "C" fn calloc(number: size_t, size: size_t) -> *mut c_void {
    match GLOBAL.calloc(number, size) {
        Ok(ptr) => ptr as *mut c_void,
        Err(err) => {
            err.set_errno();
            core::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    match GLOBAL.realloc(ptr as usize, size) {
        Ok(ptr) => ptr as *mut c_void,
        Err(err) => {
            err.set_errno();
            core::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(ptr: *mut *mut c_void, alignment: size_t, size: size_t) -> c_int {
    match GLOBAL.posix_memalign(alignment, size) {
        Ok(result) => {
            *ptr = result.unwrap_or(0) as *mut c_void;
            0
        }
        Err(err) => err.to_errno(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    match GLOBAL.aligned_alloc(alignment, size) {
        Ok(ptr) => ptr as *mut c_void,
        Err(err) => {
            err.set_errno();
            core::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    aligned_alloc(alignment, size)
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    match GLOBAL.valloc(size) {
        Ok(ptr) => ptr as *mut c_void,
        Err(err) => {
            err.set_errno();
            core::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    let rounded = crate::config::round_up_pow2(size, crate::config::PAGE_SIZE);
    valloc(rounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_roundtrip_through_the_c_abi() {
        unsafe {
            let p = malloc(64);
            assert!(!p.is_null());
            free(p);
        }
    }

    #[test]
    fn posix_memalign_reports_einval_through_errno_and_return_code() {
        unsafe {
            let mut out: *mut c_void = core::ptr::null_mut();
            let rc = posix_memalign(&mut out, 3, 64);
            assert_eq!(rc, AllocError::InvalidAlignment.to_errno());
        }
    }

    #[test]
    fn calloc_through_the_c_abi_is_zeroed() {
        unsafe {
            let p = calloc(16, 4) as *mut u8;
            assert!(!p.is_null());
            let bytes = core::slice::from_raw_parts(p, 64);
            assert!(bytes.iter().all(|&b| b == 0));
            free(p as *mut c_void);
        }
    }
}
