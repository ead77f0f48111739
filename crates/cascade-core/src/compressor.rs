//! The multi-threaded driver: partitions input into overlapping sections,
//! dispatches them to the worker pool, and reassembles the outputs into a
//! single valid frame. Blocking one-shot and non-blocking streaming APIs
//! share the job table, the drain protocol, and the pools.

use std::sync::Arc;

use tracing::{debug, trace};
use xxhash_rust::xxh64::Xxh64;

use crate::buffer::BufferPool;
use crate::codec::{
    compress_bound, Dictionary, FrameEncoder, FrameParams, BLOCK_SIZE_MAX,
};
use crate::core::{ContextPool, Task, ThreadPool};
use crate::error::{CascadeError, Result};
use crate::job::{JobRequest, JobSlot, JobTable};
use crate::params::{
    CompressionParams, MtParameter, JOB_SIZE_MAX, JOB_SIZE_MIN, NB_WORKERS_MAX,
    OVERLAP_LOG_DEFAULT,
};
use crate::partition;
use crate::types::{EndDirective, FrameProgression, InBuffer, OutBuffer};
use crate::worker;

/// Parallel compression context.
///
/// Owns a fixed worker pool, a job table, and the buffer and context pools
/// shared with the workers. Dropping it joins the workers first, then
/// releases every pooled resource.
pub struct ParallelCompressor {
    // declared first so workers are joined before the shared state drops
    pool: ThreadPool,
    table: Arc<JobTable>,
    buf_pool: Arc<BufferPool>,
    ctx_pool: Arc<ContextPool>,
    params: CompressionParams,
    frame: FrameState,
}

/// Per-frame driver state, rebuilt by every init/reset.
struct FrameState {
    target_section_size: usize,
    target_prefix_size: usize,
    in_buff_size: usize,
    /// Staging buffer; its length is the fill level, and the first
    /// `prefix_size` bytes are the overlap carried from the previous section.
    in_buff: Option<Vec<u8>>,
    prefix_size: usize,
    next_job_id: usize,
    done_job_id: usize,
    /// Prepared-but-unsubmitted job: a one-slot mailbox retried before any
    /// new ingest when the worker pool had no free worker.
    pending_task: Option<Task>,
    frame_ended: bool,
    all_jobs_completed: bool,
    frame_content_size: Option<u64>,
    checksum_enabled: bool,
    hash: Xxh64,
    consumed: u64,
    produced: u64,
    dict: Option<Arc<Dictionary>>,
    /// Degenerate synchronous path for small or single-worker frames.
    single: Option<SingleStream>,
    initialized: bool,
}

impl FrameState {
    fn idle() -> Self {
        Self {
            target_section_size: 0,
            target_prefix_size: 0,
            in_buff_size: 0,
            in_buff: None,
            prefix_size: 0,
            next_job_id: 0,
            done_job_id: 0,
            pending_task: None,
            frame_ended: false,
            all_jobs_completed: true,
            frame_content_size: None,
            checksum_enabled: false,
            hash: Xxh64::new(0),
            consumed: 0,
            produced: 0,
            dict: None,
            single: None,
            initialized: false,
        }
    }
}

impl ParallelCompressor {
    pub fn new(nb_workers: usize) -> Self {
        Self::with_params(nb_workers, CompressionParams::default())
    }

    pub fn with_params(nb_workers: usize, params: CompressionParams) -> Self {
        Self::build(nb_workers, params, None)
    }

    /// Like [`with_params`](Self::with_params), but bounds how many staging
    /// and output buffers may exist at once. When the budget is exhausted the
    /// affected frame fails with [`CascadeError::MemoryAllocation`].
    pub fn with_memory_limit(
        nb_workers: usize,
        params: CompressionParams,
        max_live_buffers: usize,
    ) -> Self {
        Self::build(nb_workers, params, Some(max_live_buffers))
    }

    fn build(nb_workers: usize, params: CompressionParams, buffer_cap: Option<usize>) -> Self {
        let nb_workers = nb_workers.clamp(1, NB_WORKERS_MAX);
        debug!(nb_workers, "creating parallel compressor");
        Self {
            pool: ThreadPool::new(nb_workers),
            table: Arc::new(JobTable::new(partition::ring_size_for(nb_workers + 2))),
            buf_pool: Arc::new(BufferPool::with_alloc_cap(nb_workers, buffer_cap)),
            ctx_pool: Arc::new(ContextPool::new(nb_workers)),
            params,
            frame: FrameState::idle(),
        }
    }

    pub fn nb_workers(&self) -> usize {
        self.pool.nb_workers()
    }

    /// Adjusts a driver-level tunable; returns the effective (clamped) value.
    pub fn set_parameter(&mut self, param: MtParameter) -> Result<usize> {
        match param {
            MtParameter::JobSize(size) => {
                let clamped = if size == 0 {
                    0
                } else {
                    size.clamp(JOB_SIZE_MIN, JOB_SIZE_MAX)
                };
                self.params.job_size = clamped;
                Ok(clamped)
            }
            MtParameter::OverlapSectionLog(log) => {
                let clamped = log.min(9);
                self.params.overlap_log = clamped;
                Ok(clamped as usize)
            }
        }
    }

    /// Approximate memory held by the context: cached buffers, cached
    /// compressor contexts, and the job table.
    pub fn memory_footprint(&self) -> usize {
        // deflate state with its window, rounded up
        const CONTEXT_FOOTPRINT: usize = 300 * 1024;
        std::mem::size_of::<Self>()
            + self.buf_pool.cached_bytes()
            + self.ctx_pool.available() * CONTEXT_FOOTPRINT
            + self.table.ring_size() * std::mem::size_of::<JobSlot>()
    }

    // =====  Blocking one-shot API  =====

    /// Compresses `src` into a fresh vector using the sticky parameters.
    pub fn compress(&mut self, src: &[u8]) -> Result<Vec<u8>> {
        let mut dst = vec![0u8; compress_bound(src.len())];
        let written = self.compress_to(&mut dst, src)?;
        dst.truncate(written);
        Ok(dst)
    }

    /// Compresses `src` into `dst` using the sticky parameters.
    pub fn compress_to(&mut self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        let params = self.params.clone();
        let overlap_log = params.overlap_log;
        self.compress_advanced(dst, src, None, params, overlap_log)
    }

    /// Compresses `src` into `dst` with level-derived parameters.
    pub fn compress_with_level(&mut self, dst: &mut [u8], src: &[u8], level: u32) -> Result<usize> {
        let params = CompressionParams::from_level(level);
        let overlap_log = if level >= 9 { 9 } else { OVERLAP_LOG_DEFAULT };
        self.compress_advanced(dst, src, None, params, overlap_log)
    }

    /// Fully parameterized blocking compression, with an optional prepared
    /// dictionary for the first section.
    pub fn compress_advanced(
        &mut self,
        dst: &mut [u8],
        src: &[u8],
        dict: Option<Arc<Dictionary>>,
        mut params: CompressionParams,
        overlap_log: u32,
    ) -> Result<usize> {
        params.overlap_log = overlap_log;
        params.validate()?;
        let mut output = OutBuffer::new(dst);
        self.compress_internal(&mut output, src, dict, params)?;
        Ok(output.pos)
    }

    fn compress_internal(
        &mut self,
        output: &mut OutBuffer,
        src: &[u8],
        dict: Option<Arc<Dictionary>>,
        params: CompressionParams,
    ) -> Result<()> {
        let nb_workers = self.pool.nb_workers();
        let overlap = partition::overlap_size(params.window_log, params.resolved_overlap_log());
        let nb = partition::nb_chunks(src.len(), params.window_log, nb_workers);
        debug!(nb_chunks = nb, src_size = src.len(), "one-shot compression");

        self.begin_frame(&params, Some(src.len() as u64), dict.clone());

        if nb == 1 || nb_workers <= 1 {
            return self.compress_single(output, src, dict, &params);
        }

        let avg = partition::average_chunk_size(src.len(), nb);
        debug_assert!(avg >= 256 << 10, "section size must allow in-order drain");
        self.buf_pool
            .set_target_size(compress_bound(avg).max(avg + overlap));

        let ring_size = self.table.ring_size();
        let mut start = 0usize;
        let mut remaining = src.len();
        for u in 0..nb {
            // the ring is a sliding window: drain before it would overflow
            while self.frame.next_job_id - self.frame.done_job_id >= ring_size {
                self.drain_oneshot(output)?;
            }
            let chunk = remaining.min(avg);
            let prefix = if u == 0 { 0 } else { overlap };
            let Some(mut staged) = self.buf_pool.acquire() else {
                self.wait_for_all_jobs();
                self.release_all_job_resources();
                return Err(CascadeError::MemoryAllocation);
            };
            staged.extend_from_slice(&src[start - prefix..start + chunk]);
            if self.frame.checksum_enabled {
                self.frame.hash.update(&src[start..start + chunk]);
            }

            {
                let mut slots = self.table.lock();
                let slot = &mut slots[u & self.table.mask()];
                slot.reset();
                slot.src_size = chunk as u64;
                slot.frame_checksum_needed = self.frame.checksum_enabled && u == nb - 1 && u > 0;
            }
            let request = JobRequest {
                job_id: u,
                src: staged,
                prefix_size: prefix,
                src_size: chunk,
                first_chunk: u == 0,
                last_chunk: u == nb - 1,
                params: FrameParams {
                    level: params.level,
                    checksum: u == 0 && self.frame.checksum_enabled,
                    pledged: self.frame.frame_content_size,
                    content_size_flag: params.content_size_flag,
                },
                dict: if u == 0 { dict.clone() } else { None },
                dst: None,
            };
            trace!(job = u, size = chunk, "posting one-shot job");
            self.pool.add(self.make_task(request));
            self.frame.next_job_id += 1;

            start += chunk;
            remaining -= chunk;
        }
        self.frame.frame_ended = true;

        while self.frame.done_job_id < self.frame.next_job_id {
            self.drain_oneshot(output)?;
        }
        self.frame.all_jobs_completed = true;
        Ok(())
    }

    /// Single-threaded fallback; output is byte-identical to the underlying
    /// compressor run over the whole input.
    fn compress_single(
        &mut self,
        output: &mut OutBuffer,
        src: &[u8],
        dict: Option<Arc<Dictionary>>,
        params: &CompressionParams,
    ) -> Result<()> {
        let frame_params = FrameParams {
            level: params.level,
            checksum: params.checksum,
            pledged: Some(src.len() as u64),
            content_size_flag: params.content_size_flag,
        };
        let dict_bytes = dict.as_deref().map(Dictionary::as_bytes).unwrap_or(&[]);
        let ctx = self.ctx_pool.acquire();
        let mut tmp = Vec::with_capacity(compress_bound(src.len()));
        let mut encoder = FrameEncoder::begin(ctx, &frame_params, dict_bytes, true, &mut tmp)?;
        encoder.finish_frame(&mut tmp, src)?;
        self.ctx_pool.release(encoder.into_context());

        if tmp.len() > output.remaining() {
            self.frame.all_jobs_completed = true;
            return Err(CascadeError::DstSizeTooSmall);
        }
        output.push(&tmp);
        self.frame.consumed = src.len() as u64;
        self.frame.produced = tmp.len() as u64;
        self.frame.frame_ended = true;
        self.frame.all_jobs_completed = true;
        Ok(())
    }

    fn drain_oneshot(&mut self, output: &mut OutBuffer) -> Result<()> {
        let remaining = self.flush_produced(output, true)?;
        if remaining > 0 && output.remaining() == 0 {
            self.wait_for_all_jobs();
            self.release_all_job_resources();
            return Err(CascadeError::DstSizeTooSmall);
        }
        Ok(())
    }

    // =====  Streaming API  =====

    /// Begins a frame. `pledged` is the promised content size, `None` when
    /// unknown.
    pub fn init_stream(&mut self, pledged: Option<u64>) -> Result<()> {
        self.init_stream_internal(None, pledged)
    }

    /// Begins a frame whose first section loads `dict` as a raw-content
    /// dictionary.
    pub fn init_stream_with_dictionary(&mut self, dict: &[u8], pledged: Option<u64>) -> Result<()> {
        self.init_stream_internal(Some(Arc::new(Dictionary::new(dict.to_vec()))), pledged)
    }

    /// Begins a frame using a prepared dictionary.
    pub fn init_stream_with_prepared(
        &mut self,
        dict: Option<Arc<Dictionary>>,
        pledged: Option<u64>,
    ) -> Result<()> {
        let dict = dict.ok_or(CascadeError::DictionaryWrong)?;
        self.init_stream_internal(Some(dict), pledged)
    }

    /// Re-initializes for a new frame with the sticky parameters. Any
    /// unfinished previous frame is quiesced and released first.
    pub fn reset_stream(&mut self, pledged: Option<u64>) -> Result<()> {
        self.init_stream_internal(None, pledged)
    }

    fn init_stream_internal(
        &mut self,
        dict: Option<Arc<Dictionary>>,
        pledged: Option<u64>,
    ) -> Result<()> {
        let params = self.params.clone();
        params.validate()?;
        debug!(?pledged, workers = self.pool.nb_workers(), "initializing stream");

        self.begin_frame(&params, pledged, dict.clone());

        // do not spin up the machinery for frames too small to split
        let single = self.pool.nb_workers() == 1
            || pledged.is_some_and(|n| n <= JOB_SIZE_MIN as u64);
        if single {
            debug!("single blocking thread mode");
            let frame_params = FrameParams {
                level: params.level,
                checksum: params.checksum,
                pledged,
                content_size_flag: params.content_size_flag,
            };
            let dict_bytes = dict.as_deref().map(Dictionary::as_bytes).unwrap_or(&[]);
            let ctx = self.ctx_pool.acquire();
            self.frame.single = Some(SingleStream::new(ctx, &frame_params, dict_bytes)?);
            return Ok(());
        }

        let section = params.resolved_job_size();
        self.frame.target_prefix_size =
            partition::overlap_size(params.window_log, params.resolved_overlap_log());
        // the section must at least cover the overlap it carries
        self.frame.target_section_size = section.max(self.frame.target_prefix_size);
        self.frame.in_buff_size = self.frame.target_prefix_size + self.frame.target_section_size;
        // no worker has been dispatched yet, so the target change is safe
        self.buf_pool.set_target_size(
            self.frame
                .in_buff_size
                .max(compress_bound(self.frame.target_section_size)),
        );
        Ok(())
    }

    /// One step of the streaming state machine: ingest from `input`, form and
    /// submit a job when a section is ready, drain produced output into
    /// `output`. Returns the minimum amount of data still to flush, 0 when
    /// the frame is fully drained.
    pub fn compress_stream(
        &mut self,
        output: &mut OutBuffer,
        input: &mut InBuffer,
        end: EndDirective,
    ) -> Result<usize> {
        debug_assert!(input.pos <= input.src.len());
        debug_assert!(output.pos <= output.dst.len());
        self.ensure_initialized()?;

        if let Some(single) = &mut self.frame.single {
            return single.compress(output, input, end);
        }
        if self.frame.frame_ended && end == EndDirective::Continue {
            return Err(CascadeError::StageWrong);
        }

        // single-pass shortcut: nothing staged, frame ends here, and the
        // caller's output can hold the worst case — run the blocking path
        if self.frame.next_job_id == 0
            && self.frame.pending_task.is_none()
            && self.filled() == 0
            && end == EndDirective::End
            && output.remaining() >= compress_bound(input.remaining())
        {
            debug!("single-pass shortcut");
            let params = self.params.clone();
            let dict = self.frame.dict.clone();
            let src = input.src;
            self.compress_internal(output, &src[input.pos..], dict, params)?;
            input.pos = src.len();
            return Ok(0);
        }

        let mut end = end;
        let mut forward_progress = false;
        if self.frame.pending_task.is_none() && input.remaining() > 0 {
            if self.frame.in_buff.is_none() {
                match self.buf_pool.acquire() {
                    Some(buf) => self.frame.in_buff = Some(buf),
                    // without staging room and nothing to flush, no forward
                    // progress is possible
                    None if self.frame.done_job_id == self.frame.next_job_id => {
                        return Err(CascadeError::MemoryAllocation);
                    }
                    None => {}
                }
            }
            if let Some(in_buff) = &mut self.frame.in_buff {
                let to_load = input.remaining().min(self.frame.in_buff_size - in_buff.len());
                let src = input.src;
                in_buff.extend_from_slice(&src[input.pos..input.pos + to_load]);
                input.pos += to_load;
                forward_progress = to_load > 0;
            }
            if input.remaining() > 0 && end == EndDirective::End {
                // cannot end the frame yet: not all input consumed
                end = EndDirective::Flush;
            }
        }

        let filled = self.filled();
        if self.frame.pending_task.is_some()
            || filled >= self.frame.prefix_size + self.frame.target_section_size
            || (end != EndDirective::Continue && filled > 0)
            || (end == EndDirective::End && !self.frame.frame_ended)
        {
            let pending_input = filled - self.frame.prefix_size;
            if end == EndDirective::End && pending_input > self.frame.target_section_size {
                // ending now would drop everything past one section: emit a
                // non-final section, carry the rest, finish on a later call
                end = EndDirective::Flush;
            }
            let job_size = pending_input.min(self.frame.target_section_size);
            self.create_compression_job(job_size, end == EndDirective::End)?;
        }

        // block only when this call made no forward input progress
        let remaining = self.flush_produced(output, !forward_progress)?;
        if input.remaining() > 0 {
            Ok(remaining.max(1))
        } else {
            Ok(remaining)
        }
    }

    /// Drains buffered and in-flight output without ending the frame.
    /// Returns 0 once everything produced so far has been flushed.
    pub fn flush_stream(&mut self, output: &mut OutBuffer) -> Result<usize> {
        self.ensure_initialized()?;
        if let Some(single) = &mut self.frame.single {
            let mut empty = InBuffer::new(&[]);
            return single.compress(output, &mut empty, EndDirective::Flush);
        }
        self.flush_stream_internal(output, false)
    }

    /// Ends the frame and drains. Returns 0 once the frame is complete in
    /// the caller's output.
    pub fn end_stream(&mut self, output: &mut OutBuffer) -> Result<usize> {
        self.ensure_initialized()?;
        if let Some(single) = &mut self.frame.single {
            let mut empty = InBuffer::new(&[]);
            return single.compress(output, &mut empty, EndDirective::End);
        }
        self.flush_stream_internal(output, true)
    }

    fn flush_stream_internal(&mut self, output: &mut OutBuffer, end_frame: bool) -> Result<usize> {
        // uncapped: the job must cover all staged input, which can run past
        // one section when ring pressure deferred job creation
        let src_size = self.filled() - self.frame.prefix_size;
        if self.frame.pending_task.is_some()
            || src_size > 0
            || (end_frame && !self.frame.frame_ended)
        {
            self.create_compression_job(src_size, end_frame)?;
        }
        self.flush_produced(output, true)
    }

    /// Filling the staging buffer up to this amount avoids a copy stall on
    /// the next call.
    pub fn recommended_input_size(&self) -> usize {
        if self.frame.single.is_some() {
            return BLOCK_SIZE_MAX;
        }
        self.frame.in_buff_size.saturating_sub(self.filled())
    }

    /// Progress counters for the current frame, including partial progress
    /// inside worker threads.
    pub fn frame_progression(&self) -> FrameProgression {
        if let Some(single) = &self.frame.single {
            return single.progression();
        }
        let slots = self.table.lock();
        let mut fp = FrameProgression {
            consumed: self.frame.consumed,
            ingested: self.frame.consumed + (self.filled() - self.frame.prefix_size) as u64,
            produced: self.frame.produced,
        };
        let last = self.frame.next_job_id + usize::from(self.frame.pending_task.is_some());
        for job in self.frame.done_job_id..last {
            let slot = &slots[job & self.table.mask()];
            fp.consumed += slot.consumed;
            fp.ingested += slot.src_size;
            if slot.error.is_none() {
                fp.produced += slot.produced() as u64;
            }
        }
        fp
    }

    // =====  Internal machinery  =====

    fn ensure_initialized(&mut self) -> Result<()> {
        if !self.frame.initialized {
            self.init_stream(None)?;
        }
        Ok(())
    }

    fn filled(&self) -> usize {
        self.frame.in_buff.as_ref().map_or(0, Vec::len)
    }

    /// Quiesces any unfinished frame and rebuilds the per-frame state.
    fn begin_frame(
        &mut self,
        params: &CompressionParams,
        pledged: Option<u64>,
        dict: Option<Arc<Dictionary>>,
    ) {
        if !self.frame.all_jobs_completed {
            self.wait_for_all_jobs();
            self.release_all_job_resources();
        }
        if let Some(single) = self.frame.single.take() {
            self.ctx_pool.release(single.into_context());
        }
        if let Some(buf) = self.frame.in_buff.take() {
            self.buf_pool.release(buf);
        }
        self.frame = FrameState {
            all_jobs_completed: false,
            checksum_enabled: params.checksum,
            frame_content_size: pledged,
            dict,
            initialized: true,
            ..FrameState::idle()
        };
    }

    fn make_task(&self, request: JobRequest) -> Task {
        let table = Arc::clone(&self.table);
        let ctx_pool = Arc::clone(&self.ctx_pool);
        let buf_pool = Arc::clone(&self.buf_pool);
        Box::new(move || worker::compress_chunk(request, &table, &ctx_pool, &buf_pool))
    }

    /// Forms a job from the staged input and hands it to the pool. Refuses
    /// quietly when the ring is full; retains the job when no worker is free.
    fn create_compression_job(&mut self, src_size: usize, end_frame: bool) -> Result<()> {
        if self.frame.next_job_id - self.frame.done_job_id > self.table.mask() {
            trace!("job table full, not creating a new job");
            return Ok(());
        }
        if self.frame.pending_task.is_none() {
            self.prepare_job(src_size, end_frame)?;
        }
        let task = self.frame.pending_task.take().expect("job prepared above");
        match self.pool.try_add(task) {
            Ok(()) => {
                trace!(job = self.frame.next_job_id, "job submitted");
                self.frame.next_job_id += 1;
            }
            Err(task) => {
                trace!(
                    job = self.frame.next_job_id,
                    "no worker available, retaining prepared job"
                );
                self.frame.pending_task = Some(task);
            }
        }
        Ok(())
    }

    fn prepare_job(&mut self, src_size: usize, end_frame: bool) -> Result<()> {
        let next = self.frame.next_job_id;
        let slot_idx = next & self.table.mask();
        trace!(job = next, src_size, end_frame, "preparing compression job");
        {
            let mut slots = self.table.lock();
            let slot = &mut slots[slot_idx];
            slot.reset();
            slot.src_size = src_size as u64;
            slot.frame_checksum_needed = end_frame && next > 0 && self.frame.checksum_enabled;
        }

        let src = self.frame.in_buff.take().unwrap_or_default();
        let prefix_size = self.frame.prefix_size;
        debug_assert!(src.len() >= prefix_size + src_size);
        if self.frame.checksum_enabled {
            self.frame
                .hash
                .update(&src[prefix_size..prefix_size + src_size]);
        }

        let frame_params = FrameParams {
            // a single-job frame keeps the checksum flag so the worker
            // appends the digest itself; later jobs never hash
            level: self.params.level,
            checksum: next == 0 && self.frame.checksum_enabled,
            pledged: self.frame.frame_content_size,
            content_size_flag: self.params.content_size_flag,
        };

        if !end_frame {
            let new_prefix = (src_size + prefix_size).min(self.frame.target_prefix_size);
            let Some(mut next_buf) = self.buf_pool.acquire() else {
                // cannot stage further input: abandon the frame
                {
                    let mut slots = self.table.lock();
                    slots[slot_idx].completed = true;
                }
                self.frame.next_job_id += 1;
                self.buf_pool.release(src);
                self.wait_for_all_jobs();
                self.release_all_job_resources();
                return Err(CascadeError::MemoryAllocation);
            };
            // carry the tail of the outgoing section: the new prefix plus any
            // staged input beyond this job's section
            let carry_from = prefix_size + src_size - new_prefix;
            next_buf.extend_from_slice(&src[carry_from..]);
            self.frame.in_buff = Some(next_buf);
            self.frame.prefix_size = new_prefix;
        } else {
            self.frame.in_buff = None;
            self.frame.prefix_size = 0;
            self.frame.frame_ended = true;
        }

        let request = JobRequest {
            job_id: next,
            src,
            prefix_size,
            src_size,
            first_chunk: next == 0,
            last_chunk: end_frame,
            params: frame_params,
            dict: if next == 0 { self.frame.dict.clone() } else { None },
            dst: None,
        };
        self.frame.pending_task = Some(self.make_task(request));
        Ok(())
    }

    /// Copies produced output of the oldest job into `output` in job-ID
    /// order. When `block` is set and nothing is available yet, waits on the
    /// shared condition variable for worker progress.
    ///
    /// Returns how much data remains buffered: exact when known, 1 when
    /// unknown but positive, 0 when everything has been flushed.
    fn flush_produced(&mut self, output: &mut OutBuffer, block: bool) -> Result<usize> {
        let widx = self.frame.done_job_id & self.table.mask();
        let mut slots = self.table.lock();
        if block && self.frame.done_job_id < self.frame.next_job_id {
            loop {
                let slot = &slots[widx];
                if slot.completed || slot.produced() != slot.dst_flushed {
                    break;
                }
                trace!(job = self.frame.done_job_id, "waiting for output to flush");
                slots = self.table.wait(slots);
            }
        }

        if slots[widx].error.is_some() {
            let err = slots[widx].error.take().expect("checked above");
            drop(slots);
            debug!(job = self.frame.done_job_id, %err, "job failed, abandoning frame");
            self.wait_for_all_jobs();
            self.release_all_job_resources();
            return Err(err);
        }

        // append the frame checksum once the last job's output is complete
        if slots[widx].completed && slots[widx].frame_checksum_needed {
            let digest = (self.frame.hash.digest() & 0xFFFF_FFFF) as u32;
            slots[widx]
                .dst
                .as_mut()
                .expect("completed job has output")
                .extend_from_slice(&digest.to_le_bytes());
            slots[widx].frame_checksum_needed = false;
        }

        let produced = slots[widx].produced();
        let mut flushed = slots[widx].dst_flushed;
        let to_write = (produced - flushed).min(output.remaining());
        if to_write > 0 {
            let dst = slots[widx].dst.as_ref().expect("output present");
            output.push(&dst[flushed..flushed + to_write]);
            flushed += to_write;
        }
        slots[widx].dst_flushed = flushed;

        let completed = slots[widx].completed;
        let job_consumed = slots[widx].consumed;
        let job_src_size = slots[widx].src_size;
        let mut released = None;
        if completed && flushed == produced && self.frame.done_job_id < self.frame.next_job_id {
            trace!(job = self.frame.done_job_id, produced, "job fully flushed");
            released = slots[widx].dst.take();
            self.frame.consumed += job_src_size;
            self.frame.produced += produced as u64;
            slots[widx].reset();
            self.frame.done_job_id += 1;
        }
        drop(slots);
        if let Some(buf) = released {
            self.buf_pool.release(buf);
        }

        if produced > flushed {
            return Ok(produced - flushed);
        }
        if job_src_size > job_consumed {
            return Ok(1); // current job not completely compressed
        }
        if self.frame.done_job_id < self.frame.next_job_id {
            return Ok(1); // more jobs to flush
        }
        if self.frame.pending_task.is_some() {
            return Ok(1); // at least one more job to run
        }
        // the retained prefix is dictionary, not pending input
        if self.filled() > self.frame.prefix_size {
            return Ok(1); // staged input not yet formed into a job
        }
        self.frame.all_jobs_completed = self.frame.frame_ended;
        Ok(0)
    }

    fn wait_for_all_jobs(&mut self) {
        while self.frame.done_job_id < self.frame.next_job_id {
            let widx = self.frame.done_job_id & self.table.mask();
            let mut slots = self.table.lock();
            while !slots[widx].completed {
                slots = self.table.wait(slots);
            }
            drop(slots);
            self.frame.done_job_id += 1;
        }
    }

    fn release_all_job_resources(&mut self) {
        debug!("releasing all job resources");
        let mut buffers = Vec::new();
        {
            let mut slots = self.table.lock();
            for slot in slots.iter_mut() {
                if let Some(dst) = slot.dst.take() {
                    buffers.push(dst);
                }
                slot.reset();
            }
        }
        for buf in buffers {
            self.buf_pool.release(buf);
        }
        if let Some(buf) = self.frame.in_buff.take() {
            self.buf_pool.release(buf);
        }
        self.frame.pending_task = None;
        self.frame.all_jobs_completed = true;
    }
}

/// Synchronous delegate used when the frame is too small to split or only
/// one worker exists. Byte-compatible with the one-shot single-thread path.
struct SingleStream {
    encoder: FrameEncoder,
    pending: Vec<u8>,
    drained: usize,
    ended: bool,
    consumed: u64,
    produced: u64,
}

impl SingleStream {
    fn new(
        ctx: crate::codec::CompressContext,
        params: &FrameParams,
        dict: &[u8],
    ) -> Result<Self> {
        let mut pending = Vec::new();
        let encoder = FrameEncoder::begin(ctx, params, dict, true, &mut pending)?;
        let produced = pending.len() as u64;
        Ok(Self {
            encoder,
            pending,
            drained: 0,
            ended: false,
            consumed: 0,
            produced,
        })
    }

    fn compress(
        &mut self,
        output: &mut OutBuffer,
        input: &mut InBuffer,
        end: EndDirective,
    ) -> Result<usize> {
        if self.ended && (end == EndDirective::Continue || input.remaining() > 0) {
            return Err(CascadeError::StageWrong);
        }
        let before = self.pending.len();
        if input.remaining() > 0 {
            let to_consume = input.remaining() as u64;
            let src = input.src;
            self.encoder.write_block(&mut self.pending, &src[input.pos..])?;
            self.consumed += to_consume;
            input.pos = src.len();
        }
        match end {
            EndDirective::End if !self.ended => {
                self.encoder.finish_frame(&mut self.pending, &[])?;
                self.ended = true;
            }
            EndDirective::Flush if !self.ended => {
                self.encoder.sync_chunk(&mut self.pending, &[])?;
            }
            _ => {}
        }
        self.produced += (self.pending.len() - before) as u64;

        let to_write = (self.pending.len() - self.drained).min(output.remaining());
        if to_write > 0 {
            output.push(&self.pending[self.drained..self.drained + to_write]);
            self.drained += to_write;
        }
        if self.drained == self.pending.len() {
            self.pending.clear();
            self.drained = 0;
        }
        Ok(self.pending.len() - self.drained)
    }

    fn progression(&self) -> FrameProgression {
        FrameProgression {
            consumed: self.consumed,
            ingested: self.consumed,
            produced: self.produced,
        }
    }

    fn into_context(self) -> crate::codec::CompressContext {
        self.encoder.into_context()
    }
}
