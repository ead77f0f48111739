//! Thread-safe cache of reusable byte buffers.
//!
//! One pool serves both input staging and worker output. The target size is
//! mutable but only changed between frames, before any worker can be
//! acquiring; a cached buffer is reused only when its capacity falls within
//! `[target, 8 * target]`, otherwise it is dropped and a fresh one allocated.

use std::sync::Mutex;

use tracing::trace;

/// A pool of reusable byte buffers shared by the driver and its workers.
#[derive(Debug)]
pub struct BufferPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<Vec<u8>>,
    target_size: usize,
    capacity: usize,
    /// Buffers in existence (handed out or cached).
    live: usize,
    /// Optional memory budget: acquisition fails rather than allocate past it.
    alloc_cap: Option<usize>,
}

impl BufferPool {
    /// Creates a pool able to cache `2 * nb_workers + 3` buffers: one input
    /// and one output buffer per in-flight job, plus staging slack.
    pub fn new(nb_workers: usize) -> Self {
        Self::with_alloc_cap(nb_workers, None)
    }

    /// Like [`new`](Self::new), but refuses to let more than `cap` buffers
    /// exist at once. Acquisition past the budget returns `None`.
    pub fn with_alloc_cap(nb_workers: usize, cap: Option<usize>) -> Self {
        let capacity = 2 * nb_workers + 3;
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::with_capacity(capacity),
                target_size: 64 * 1024,
                capacity,
                live: 0,
                alloc_cap: cap,
            }),
        }
    }

    /// Changes the size served by subsequent acquisitions. Only called
    /// between frames, before any worker has been dispatched.
    pub fn set_target_size(&self, size: usize) {
        let mut inner = self.lock();
        trace!(size, "buffer pool target size");
        inner.target_size = size;
    }

    /// Pops a cached buffer if one fits the current target, else allocates.
    /// Returns `None` when allocation fails or the budget is exhausted.
    pub fn acquire(&self) -> Option<Vec<u8>> {
        let target = {
            let mut inner = self.lock();
            if let Some(mut buf) = inner.free.pop() {
                let cap = buf.capacity();
                if cap >= inner.target_size && (cap >> 3) <= inner.target_size {
                    buf.clear();
                    return Some(buf);
                }
                // cached buffer does not meet size conditions: drop it
                trace!(cap, target = inner.target_size, "dropping misfit buffer");
                inner.live = inner.live.saturating_sub(1);
            }
            if let Some(cap) = inner.alloc_cap {
                if inner.live >= cap {
                    return None;
                }
            }
            inner.live += 1;
            inner.target_size
        };
        // allocate outside the lock
        let mut buf = Vec::new();
        if buf.try_reserve_exact(target).is_err() {
            let mut inner = self.lock();
            inner.live = inner.live.saturating_sub(1);
            return None;
        }
        Some(buf)
    }

    /// Stores `buf` for later reuse, or frees it when the pool is full.
    pub fn release(&self, buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        let mut inner = self.lock();
        if inner.free.len() < inner.capacity {
            inner.free.push(buf);
        } else {
            trace!("buffer pool full, freeing buffer");
            inner.live = inner.live.saturating_sub(1);
        }
    }

    /// Number of buffers currently cached.
    pub fn cached(&self) -> usize {
        self.lock().free.len()
    }

    /// Total bytes held by cached buffers.
    pub fn cached_bytes(&self) -> usize {
        self.lock().free.iter().map(Vec::capacity).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("buffer pool mutex poisoned")
    }
}
