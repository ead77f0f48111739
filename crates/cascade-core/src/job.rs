//! The job table: a power-of-two ring of per-job progress slots behind the
//! single mutex + condition variable shared by the driver and all workers.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::codec::{Dictionary, FrameParams};
use crate::error::CascadeError;

/// Shared coordination core. Workers update their slot and signal on every
/// block of progress; the driver is the only waiter.
pub(crate) struct JobTable {
    slots: Mutex<Box<[JobSlot]>>,
    progress: Condvar,
    mask: usize,
}

impl JobTable {
    pub(crate) fn new(ring_size: usize) -> Self {
        debug_assert!(ring_size.is_power_of_two());
        let slots = (0..ring_size).map(|_| JobSlot::default()).collect();
        Self {
            slots: Mutex::new(slots),
            progress: Condvar::new(),
            mask: ring_size - 1,
        }
    }

    pub(crate) fn mask(&self) -> usize {
        self.mask
    }

    pub(crate) fn ring_size(&self) -> usize {
        self.mask + 1
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Box<[JobSlot]>> {
        self.slots.lock().expect("job table mutex poisoned")
    }

    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, Box<[JobSlot]>>,
    ) -> MutexGuard<'a, Box<[JobSlot]>> {
        self.progress.wait(guard).expect("job table mutex poisoned")
    }

    pub(crate) fn notify(&self) {
        self.progress.notify_all();
    }
}

/// One slot of the ring. While a job is in flight, the worker writes the
/// output vector, `consumed`, `completed` and `error`; the driver writes
/// `dst_flushed`. All of it under the table mutex.
#[derive(Default)]
pub(crate) struct JobSlot {
    /// Compressed output appended block by block; its length is the job's
    /// produced size.
    pub dst: Option<Vec<u8>>,
    /// Bytes already copied to the caller's output.
    pub dst_flushed: usize,
    /// Source bytes consumed so far, block-granular.
    pub consumed: u64,
    /// Source bytes this job compresses (prefix excluded).
    pub src_size: u64,
    pub completed: bool,
    pub error: Option<CascadeError>,
    /// The driver appends the frame digest after this job's output, once.
    pub frame_checksum_needed: bool,
}

impl JobSlot {
    pub(crate) fn produced(&self) -> usize {
        self.dst.as_ref().map_or(0, Vec::len)
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Everything a worker needs for one job, moved into its closure. The source
/// buffer is owned here and returned to the buffer pool by the worker.
pub(crate) struct JobRequest {
    pub job_id: usize,
    /// Staged input; the first `prefix_size` bytes are the overlap carried
    /// from the previous section.
    pub src: Vec<u8>,
    pub prefix_size: usize,
    pub src_size: usize,
    pub first_chunk: bool,
    pub last_chunk: bool,
    pub params: FrameParams,
    /// Prepared dictionary, only legal for the first chunk.
    pub dict: Option<Arc<Dictionary>>,
    /// Output buffer supplied by the driver; the worker acquires one from
    /// the pool when absent.
    pub dst: Option<Vec<u8>>,
}
