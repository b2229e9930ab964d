//! Cross-thread frees must localize reclaimed pages to the *freeing*
//! thread's cache, and many threads doing bounded random alloc/free traffic
//! must never crash, double free, or leave overlapping live allocations.

use kissalloc_rs::Allocator;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

/// Thread A allocates, thread B frees. No assertion can observe
/// *which* cache a page landed in from outside the crate, so this test's
/// job is to prove the handoff itself is safe: B's free of A's pointer must
/// not corrupt anything subsequent allocations on either thread read back.
#[test]
fn cross_thread_free_handoff_is_safe() {
    let alloc = Arc::new(Allocator::new());
    let (tx, rx) = channel();

    let alloc_a = alloc.clone();
    let producer = thread::spawn(move || {
        let p = alloc_a.malloc(48).expect("thread A malloc");
        unsafe {
            core::ptr::write_bytes(p as *mut u8, 0x77, 48);
        }
        tx.send(p).unwrap();
    });
    producer.join().unwrap();
    let ptr = rx.recv().unwrap();

    let alloc_b = alloc.clone();
    let consumer = thread::spawn(move || {
        let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, 48) };
        assert!(bytes.iter().all(|&b| b == 0x77));
        alloc_b.free(ptr);

        // The freeing thread should still be able to allocate afterward.
        let q = alloc_b.malloc(48).expect("thread B malloc after free");
        alloc_b.free(q);
    });
    consumer.join().unwrap();
}

/// Bounded for CI: several threads each perform a bounded number
/// of random-sized alloc/free pairs, with every other allocation handed off
/// to be freed by a different thread via a channel. No crash, no double
/// free, and every live buffer's contents survive until its own free.
#[test]
fn bounded_multithreaded_traffic_with_handoffs() {
    const THREADS: usize = 4;
    const ITERATIONS: usize = 200;

    let alloc = Arc::new(Allocator::new());
    let (tx, rx) = channel::<(usize, usize, u8)>();

    let mut handles = Vec::with_capacity(THREADS);
    for thread_index in 0..THREADS {
        let alloc = alloc.clone();
        let tx = tx.clone();
        handles.push(thread::spawn(move || {
            let mut state = (thread_index as u64 + 1).wrapping_mul(2654435761);
            let mut next_u32 = move || {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xffff_ffff) as u32
            };

            for i in 0..ITERATIONS {
                let size = 1 + (next_u32() as usize % (4 * 4096));
                let fill = (i as u8).wrapping_add(thread_index as u8);
                let p = alloc.malloc(size).expect("malloc under concurrent traffic");
                unsafe {
                    core::ptr::write_bytes(p as *mut u8, fill, size);
                }

                if next_u32() % 2 == 0 {
                    // Verify and free locally.
                    let bytes = unsafe { core::slice::from_raw_parts(p as *const u8, size) };
                    assert!(bytes.iter().all(|&b| b == fill));
                    alloc.free(p);
                } else {
                    // Hand off to be verified and freed by whichever thread
                    // drains the channel next.
                    tx.send((p, size, fill)).unwrap();
                }
            }
        }));
    }
    drop(tx);

    // A dedicated consumer thread frees every handed-off allocation it
    // receives, exercising the cross-thread free path under contention.
    let alloc_consumer = alloc.clone();
    let consumer = thread::spawn(move || {
        for (p, size, fill) in rx.iter() {
            let bytes = unsafe { core::slice::from_raw_parts(p as *const u8, size) };
            assert!(bytes.iter().all(|&b| b == fill), "handed-off allocation corrupted before free");
            alloc_consumer.free(p);
        }
    });

    for handle in handles {
        handle.join().expect("producer thread panicked");
    }
    consumer.join().expect("consumer thread panicked");
}
