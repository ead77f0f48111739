use std::sync::Arc;
use std::thread;

use cascade_core::BufferPool;

#[test]
fn acquire_recycles_within_fit_window() {
    let pool = BufferPool::new(2);
    pool.set_target_size(4096);

    let buf = pool.acquire().expect("allocation");
    assert!(buf.capacity() >= 4096);
    pool.release(buf);
    assert_eq!(pool.cached(), 1);

    let buf = pool.acquire().expect("recycled");
    assert!(buf.capacity() >= 4096);
    assert_eq!(pool.cached(), 0);
}

#[test]
fn undersized_cached_buffers_are_replaced() {
    let pool = BufferPool::new(2);
    pool.set_target_size(4096);
    let buf = pool.acquire().expect("allocation");
    pool.release(buf);

    pool.set_target_size(64 * 1024);
    let buf = pool.acquire().expect("fresh allocation");
    assert!(buf.capacity() >= 64 * 1024);
    assert_eq!(pool.cached(), 0);
}

#[test]
fn oversized_cached_buffers_are_not_reused() {
    let pool = BufferPool::new(2);
    pool.set_target_size(64 * 1024);
    let buf = pool.acquire().expect("allocation");
    pool.release(buf);

    // a 64 KiB buffer is more than 8x the new target: wastefully large
    pool.set_target_size(1024);
    let buf = pool.acquire().expect("fresh allocation");
    assert!(buf.capacity() >= 1024);
    assert!(buf.capacity() <= 8 * 1024);
}

#[test]
fn pool_capacity_is_two_per_worker_plus_three() {
    let pool = BufferPool::new(1);
    pool.set_target_size(512);
    let buffers: Vec<_> = (0..6).map(|_| pool.acquire().expect("allocation")).collect();
    for buf in buffers {
        pool.release(buf);
    }
    // capacity is 2*1 + 3 = 5; the sixth released buffer is freed
    assert_eq!(pool.cached(), 5);
}

#[test]
fn alloc_cap_limits_live_buffers() {
    let pool = BufferPool::with_alloc_cap(1, Some(2));
    pool.set_target_size(1024);

    let a = pool.acquire().expect("first");
    let b = pool.acquire().expect("second");
    assert!(pool.acquire().is_none(), "budget exhausted");

    pool.release(a);
    assert!(pool.acquire().is_some(), "recycling stays possible");
    drop(b);
}

#[test]
fn acquire_is_thread_safe() {
    let pool = Arc::new(BufferPool::new(4));
    pool.set_target_size(8 * 1024);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            for _ in 0..200 {
                let mut buf = pool.acquire().expect("allocation");
                buf.extend_from_slice(b"cascade");
                pool.release(buf);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    assert!(pool.cached() >= 1);
}
