//! `ThreadEnv`: the per-thread slot holding a thread's active bucket page,
//! plus the one-shot platform TLS key that runs `bucket::thread_exit_cleanup`
//! when a thread exits.
//!
//! Mirrors `kiss/malloc/src/malloc.c`'s `pthread_key_create(&bucket_key,
//! bucket_cleanup)` / `pthread_once(&bucket_init_control, bucket_init)` pair
//! on unix, with an `FlsAlloc`-based equivalent for Windows.

use crate::bucket;
use crate::stats::Stats;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const INIT: u8 = 2;

/// A minimal spin-based "call once" guard, since this crate has no access to
/// `std::sync::Once` (the allocator must not depend on an allocator-backed
/// primitive to bootstrap itself).
struct OnceFlag(AtomicU8);

impl OnceFlag {
    const fn new() -> Self {
        OnceFlag(AtomicU8::new(UNINIT))
    }

    fn call_once(&self, f: impl FnOnce()) {
        loop {
            match self.0.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    f();
                    self.0.store(INIT, Ordering::Release);
                    return;
                }
                Err(INIT) => return,
                Err(_) => core::hint::spin_loop(),
            }
        }
    }
}

static KEY_ONCE: OnceFlag = OnceFlag::new();

#[cfg(not(windows))]
mod platform {
    use super::*;

    static mut KEY: libc::pthread_key_t = 0;

    unsafe extern "C" fn destructor(arg: *mut libc::c_void) {
        let page = arg as usize;
        if page != bucket::NO_PAGE {
            bucket::thread_exit_cleanup(page, &crate::GLOBAL_STATS);
        }
    }

    pub fn ensure_key() {
        KEY_ONCE.call_once(|| unsafe {
            if libc::pthread_key_create(&mut KEY, Some(destructor)) != 0 {
                libc::abort();
            }
        });
    }

    pub fn get() -> usize {
        ensure_key();
        unsafe { libc::pthread_getspecific(KEY) as usize }
    }

    pub fn set(page: usize) {
        ensure_key();
        unsafe {
            libc::pthread_setspecific(KEY, page as *const libc::c_void);
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use winapi::shared::minwindef::{DWORD, LPVOID};
    use winapi::um::fibersapi::{FlsAlloc, FlsFree, FlsGetValue, FlsSetValue};

    const FLS_OUT_OF_INDEXES: DWORD = 0xFFFFFFFF;

    static mut INDEX: DWORD = FLS_OUT_OF_INDEXES;

    unsafe extern "system" fn destructor(arg: LPVOID) {
        let page = arg as usize;
        if page != bucket::NO_PAGE {
            bucket::thread_exit_cleanup(page, &crate::GLOBAL_STATS);
        }
    }

    pub fn ensure_key() {
        KEY_ONCE.call_once(|| unsafe {
            INDEX = FlsAlloc(Some(destructor));
            if INDEX == FLS_OUT_OF_INDEXES {
                libc::abort();
            }
        });
    }

    pub fn get() -> usize {
        ensure_key();
        unsafe { FlsGetValue(INDEX) as usize }
    }

    pub fn set(page: usize) {
        ensure_key();
        unsafe {
            FlsSetValue(INDEX, page as LPVOID);
        }
    }

    #[allow(dead_code)]
    fn free_index() {
        unsafe {
            if INDEX != FLS_OUT_OF_INDEXES {
                FlsFree(INDEX);
            }
        }
    }
}

/// Returns this thread's active bucket page, or `bucket::NO_PAGE` if it has
/// never allocated.
pub fn get() -> usize {
    platform::get()
}

/// Publishes `page` as this thread's active bucket page.
pub fn set(page: usize) {
    platform::set(page);
}

/// Runs `f` with this thread's bucket slot as a mutable `usize`, publishing
/// whatever `f` leaves it as back to the TLS slot. This is the seam `alloc`
/// uses so `bucket::alloc_small`'s `&mut usize` signature does not need to
/// know how thread-local storage is implemented.
pub fn with_current<R>(f: impl FnOnce(&mut usize, &Stats) -> R, stats: &Stats) -> R {
    let mut current = get();
    let result = f(&mut current, stats);
    set(current);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_flag_runs_exactly_once() {
        use core::sync::atomic::AtomicUsize;
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        static FLAG: OnceFlag = OnceFlag::new();
        for _ in 0..8 {
            FLAG.call_once(|| {
                COUNT.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(COUNT.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fresh_thread_has_no_bucket() {
        // Run in a real fresh thread: the main test thread may already have
        // a slot from an earlier test in the same binary.
        let handle = std::thread::spawn(|| get());
        assert_eq!(handle.join().unwrap(), bucket::NO_PAGE);
    }

    #[test]
    fn set_then_get_roundtrips_within_a_thread() {
        let handle = std::thread::spawn(|| {
            assert_eq!(get(), bucket::NO_PAGE);
            set(0x1234_5000);
            assert_eq!(get(), 0x1234_5000);
            // Avoid running the real destructor on a fake address: clear
            // before the thread exits.
            set(bucket::NO_PAGE);
        });
        handle.join().unwrap();
    }
}
