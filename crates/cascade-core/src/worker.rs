//! The routine each worker runs for one job: prime a pooled context,
//! compress the section block by block, and stream progress through the
//! shared job table.

use tracing::trace;

use crate::buffer::BufferPool;
use crate::codec::{compress_bound, CompressContext, Dictionary, FrameEncoder, BLOCK_SIZE_MAX};
use crate::core::ContextPool;
use crate::error::{CascadeError, Result};
use crate::job::{JobRequest, JobTable};

pub(crate) fn compress_chunk(
    mut req: JobRequest,
    table: &JobTable,
    ctx_pool: &ContextPool,
    buf_pool: &BufferPool,
) {
    let slot_idx = req.job_id & table.mask();
    trace!(
        job = req.job_id,
        src_size = req.src_size,
        prefix = req.prefix_size,
        last = req.last_chunk,
        "worker picked up job"
    );

    let ctx = ctx_pool.acquire();
    match run_job(&mut req, ctx, table, slot_idx, buf_pool) {
        Ok(ctx) => ctx_pool.release(ctx),
        Err(err) => {
            let mut slots = table.lock();
            slots[slot_idx].error = Some(err);
        }
    }

    // release the source and report completion
    buf_pool.release(std::mem::take(&mut req.src));
    let mut slots = table.lock();
    let slot = &mut slots[slot_idx];
    slot.consumed = req.src_size as u64;
    slot.completed = true;
    table.notify();
}

/// Compresses the job's section. Returns the context for reuse on success;
/// on failure the context is torn down with the encoder and the pool will
/// lazily recreate one.
fn run_job(
    req: &mut JobRequest,
    ctx: CompressContext,
    table: &JobTable,
    slot_idx: usize,
    buf_pool: &BufferPool,
) -> Result<CompressContext> {
    // install the output buffer
    let mut dst = match req.dst.take() {
        Some(dst) => dst,
        None => buf_pool
            .acquire()
            .ok_or(CascadeError::MemoryAllocation)?,
    };
    dst.clear();
    {
        let mut slots = table.lock();
        slots[slot_idx].dst = Some(dst);
    }

    // prime the context: a prepared dictionary on the first chunk, the
    // overlap prefix afterwards
    debug_assert!(req.dict.is_none() || req.first_chunk);
    let dict_bytes: &[u8] = if req.first_chunk {
        req.dict.as_deref().map(Dictionary::as_bytes).unwrap_or(&[])
    } else {
        &req.src[..req.prefix_size]
    };

    let mut header = Vec::new();
    let mut encoder = FrameEncoder::begin(ctx, &req.params, dict_bytes, req.first_chunk, &mut header)?;
    if !header.is_empty() {
        let mut slots = table.lock();
        append(&mut slots[slot_idx], &header);
        table.notify();
    }

    let payload = &req.src[req.prefix_size..req.prefix_size + req.src_size];
    let nb_blocks = (payload.len() + BLOCK_SIZE_MAX - 1) / BLOCK_SIZE_MAX;
    let mut scratch = Vec::with_capacity(compress_bound(BLOCK_SIZE_MAX));

    for block_nb in 1..nb_blocks {
        let block = &payload[(block_nb - 1) * BLOCK_SIZE_MAX..block_nb * BLOCK_SIZE_MAX];
        scratch.clear();
        encoder.write_block(&mut scratch, block)?;

        let mut slots = table.lock();
        let slot = &mut slots[slot_idx];
        append(slot, &scratch);
        slot.consumed = (BLOCK_SIZE_MAX * block_nb) as u64;
        table.notify();
    }

    // Last block. Its size is the remainder, except that an exact multiple
    // keeps a full block here so a zero-length final block only ever appears
    // when it must terminate the frame.
    if nb_blocks > 0 || req.last_chunk {
        let remainder = payload.len() % BLOCK_SIZE_MAX;
        let last_size = if remainder == 0 && payload.len() >= BLOCK_SIZE_MAX {
            BLOCK_SIZE_MAX
        } else {
            remainder
        };
        let block = &payload[payload.len() - last_size..];
        scratch.clear();
        if req.last_chunk {
            encoder.finish_frame(&mut scratch, block)?;
        } else {
            encoder.sync_chunk(&mut scratch, block)?;
        }

        let mut slots = table.lock();
        let slot = &mut slots[slot_idx];
        append(slot, &scratch);
        slot.consumed = req.src_size as u64;
        table.notify();
    }

    Ok(encoder.into_context())
}

fn append(slot: &mut crate::job::JobSlot, bytes: &[u8]) {
    slot.dst
        .as_mut()
        .expect("output buffer installed before compression")
        .extend_from_slice(bytes);
}
