//! Cache of reusable compressor contexts, bounded by the worker count.

use std::sync::Mutex;

use tracing::trace;

use crate::codec::CompressContext;

/// Holds up to one context per worker. One context is created eagerly so the
/// degenerate single-thread path never allocates; the rest appear lazily as
/// workers first need them.
pub struct ContextPool {
    inner: Mutex<Inner>,
}

struct Inner {
    free: Vec<CompressContext>,
    total: usize,
}

impl ContextPool {
    pub fn new(nb_workers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: vec![CompressContext::new()],
                total: nb_workers.max(1),
            }),
        }
    }

    /// Pops an available context, creating a fresh one when the pool is
    /// empty. Creation past the bound is an overflow path; the excess is
    /// destroyed again at release.
    pub fn acquire(&self) -> CompressContext {
        if let Some(ctx) = self.lock().free.pop() {
            return ctx;
        }
        trace!("context pool empty, creating a fresh context");
        CompressContext::new()
    }

    /// Returns a context to the pool; destroys it when the pool is full.
    pub fn release(&self, ctx: CompressContext) {
        let mut inner = self.lock();
        if inner.free.len() < inner.total {
            inner.free.push(ctx);
        } else {
            trace!("context pool overflow, destroying context");
        }
    }

    /// Number of contexts currently available.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Bound on pooled contexts (the worker count).
    pub fn total(&self) -> usize {
        self.lock().total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("context pool mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_context_is_created_eagerly() {
        let pool = ContextPool::new(4);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total(), 4);
    }

    #[test]
    fn release_past_bound_destroys() {
        let pool = ContextPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire(); // overflow creation
        pool.release(a);
        pool.release(b); // pool already holds one: destroyed
        assert_eq!(pool.available(), 1);
    }
}
