use cascade_core::{
    compress_bound, decode_frame, CascadeError, CompressionParams, EndDirective, InBuffer,
    OutBuffer, ParallelCompressor,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

fn params(level: u32, window_log: u32, checksum: bool) -> CompressionParams {
    let mut params = CompressionParams::from_level(level);
    params.window_log = window_log;
    params.checksum = checksum;
    params
}

/// Feeds `data` in `feed`-byte slices, optionally flushing to completion
/// every `flush_every` input bytes, then ends the frame.
fn stream_compress(
    cx: &mut ParallelCompressor,
    data: &[u8],
    feed: usize,
    flush_every: Option<usize>,
) -> Result<Vec<u8>, CascadeError> {
    cx.init_stream(None)?;
    let mut out = vec![0u8; compress_bound(data.len()) + 1024];
    let mut output = OutBuffer::new(&mut out);

    let mut since_flush = 0usize;
    for slice in data.chunks(feed.max(1)) {
        let mut input = InBuffer::new(slice);
        while input.remaining() > 0 {
            cx.compress_stream(&mut output, &mut input, EndDirective::Continue)?;
        }
        since_flush += slice.len();
        if let Some(interval) = flush_every {
            if since_flush >= interval {
                since_flush = 0;
                loop {
                    if cx.flush_stream(&mut output)? == 0 {
                        break;
                    }
                }
            }
        }
    }
    loop {
        if cx.end_stream(&mut output)? == 0 {
            break;
        }
    }
    let written = output.pos;
    out.truncate(written);
    Ok(out)
}

#[test]
fn tiny_feeds_with_interleaved_flushes_round_trip() {
    let data: Vec<u8> = b"abcd".iter().copied().cycle().take(2 << 20).collect();
    let mut cx = ParallelCompressor::with_params(4, params(3, 17, true));

    let compressed = stream_compress(&mut cx, &data, 17, Some(256 << 10)).expect("streaming");
    assert_eq!(decode_frame(&compressed).expect("round trip"), data);
}

#[test]
fn streaming_equals_oneshot_after_decoding() {
    let mut data = random_bytes(1 << 20, 3);
    data.extend_from_slice(&b"cascade".repeat(200_000));
    let p = params(6, 17, true);

    let mut cx = ParallelCompressor::with_params(4, p.clone());
    let streamed = stream_compress(&mut cx, &data, 64 << 10, None).expect("streaming");

    let mut cx = ParallelCompressor::with_params(4, p);
    let oneshot = cx.compress(&data).expect("one-shot");

    assert_eq!(decode_frame(&streamed).expect("streamed"), data);
    assert_eq!(decode_frame(&oneshot).expect("one-shot"), data);
}

#[test]
fn progress_counters_are_monotonic() {
    let data = random_bytes(3 << 20, 11);
    let mut cx = ParallelCompressor::with_params(4, params(3, 17, false));
    cx.init_stream(None).expect("init");

    let mut out = vec![0u8; compress_bound(data.len())];
    let mut output = OutBuffer::new(&mut out);
    let mut previous = cx.frame_progression();

    for slice in data.chunks(128 << 10) {
        let mut input = InBuffer::new(slice);
        while input.remaining() > 0 {
            cx.compress_stream(&mut output, &mut input, EndDirective::Continue).expect("stream");
        }
        let current = cx.frame_progression();
        assert!(current.consumed >= previous.consumed);
        assert!(current.ingested >= previous.ingested);
        assert!(current.produced >= previous.produced);
        assert!(current.ingested >= current.consumed);
        previous = current;
    }
    loop {
        if cx.end_stream(&mut output).expect("end") == 0 {
            break;
        }
    }
    let done = cx.frame_progression();
    assert_eq!(done.consumed, data.len() as u64);
    assert_eq!(done.ingested, data.len() as u64);
}

#[test]
fn single_pass_shortcut_matches_one_worker_frame() {
    let data = [0u8];
    let mut cx = ParallelCompressor::with_params(2, params(5, 17, false));
    cx.init_stream(None).expect("init");

    let mut out = vec![0u8; compress_bound(data.len())];
    let mut output = OutBuffer::new(&mut out);
    let mut input = InBuffer::new(&data);
    let remaining = cx
        .compress_stream(&mut output, &mut input, EndDirective::End)
        .expect("shortcut");
    assert_eq!(remaining, 0);
    assert_eq!(input.remaining(), 0);

    // ending the frame forbids further Continue calls
    let mut more = InBuffer::new(b"x");
    assert!(matches!(
        cx.compress_stream(&mut output, &mut more, EndDirective::Continue),
        Err(CascadeError::StageWrong)
    ));

    let written = output.pos;
    let shortcut = &out[..written];
    let mut single = ParallelCompressor::with_params(1, params(5, 17, false));
    let expected = single.compress(&data).expect("one worker");
    assert_eq!(shortcut, &expected[..]);
}

#[test]
fn one_call_end_keeps_input_past_one_section() {
    // a single End call can stage more than one section (up to the staging
    // buffer); the tail beyond the section boundary must reach the frame
    let data = random_bytes(520 << 10, 13);
    let mut cx = ParallelCompressor::with_params(4, params(3, 17, true));
    cx.init_stream(None).expect("init");

    // too small for the single-pass shortcut, large enough for the frame
    let mut out = vec![0u8; data.len() + 2048];
    let mut output = OutBuffer::new(&mut out);
    let mut input = InBuffer::new(&data);
    let mut finished = false;
    for _ in 0..100 {
        let remaining = cx
            .compress_stream(&mut output, &mut input, EndDirective::End)
            .expect("stream");
        if remaining == 0 {
            finished = true;
            break;
        }
    }
    assert!(finished, "frame never finished draining");
    assert_eq!(input.remaining(), 0);

    let written = output.pos;
    assert_eq!(decode_frame(&out[..written]).expect("round trip"), data);
}

#[test]
fn small_pledged_size_delegates_to_single_thread() {
    let data = random_bytes(100 << 10, 21);
    let p = params(6, 17, true);

    let mut cx = ParallelCompressor::with_params(4, p.clone());
    cx.init_stream(Some(data.len() as u64)).expect("init");
    let mut out = vec![0u8; compress_bound(data.len())];
    let mut output = OutBuffer::new(&mut out);
    for slice in data.chunks(7777) {
        let mut input = InBuffer::new(slice);
        while input.remaining() > 0 {
            cx.compress_stream(&mut output, &mut input, EndDirective::Continue).expect("stream");
        }
    }
    loop {
        if cx.end_stream(&mut output).expect("end") == 0 {
            break;
        }
    }
    let streamed_len = output.pos;
    let streamed = &out[..streamed_len];

    let mut single = ParallelCompressor::with_params(1, p);
    let mut expected = vec![0u8; compress_bound(data.len())];
    let written = single.compress_to(&mut expected, &data).expect("one worker");

    assert_eq!(streamed, &expected[..written]);
}

#[test]
fn worker_side_checksum_does_not_leak_into_later_frames() {
    let p = params(6, 17, true);
    let mut cx = ParallelCompressor::with_params(4, p);

    // frame 1: a single job carries the whole frame, so the worker itself
    // appends the checksum
    let small = random_bytes(100 << 10, 5);
    cx.init_stream(None).expect("init");
    let mut out1 = vec![0u8; compress_bound(small.len())];
    let mut output = OutBuffer::new(&mut out1);
    let mut input = InBuffer::new(&small);
    while input.remaining() > 0 {
        cx.compress_stream(&mut output, &mut input, EndDirective::Continue).expect("stream");
    }
    loop {
        if cx.end_stream(&mut output).expect("end") == 0 {
            break;
        }
    }
    let frame1_len = output.pos;
    let frame1 = &out1[..frame1_len];
    assert_eq!(frame1[4] & 1, 1, "frame 1 declares its checksum");
    assert_eq!(decode_frame(frame1).expect("frame 1"), small);

    // frame 2: multi-job, the driver appends the checksum; the single-job
    // special case above must not have disabled checksums stickily
    let big = random_bytes(2 << 20, 6);
    cx.reset_stream(None).expect("reset");
    let mut out2 = vec![0u8; compress_bound(big.len())];
    let mut output = OutBuffer::new(&mut out2);
    for slice in big.chunks(100 << 10) {
        let mut input = InBuffer::new(slice);
        while input.remaining() > 0 {
            cx.compress_stream(&mut output, &mut input, EndDirective::Continue).expect("stream");
        }
    }
    loop {
        if cx.end_stream(&mut output).expect("end") == 0 {
            break;
        }
    }
    let frame2_len = output.pos;
    let frame2 = &out2[..frame2_len];
    assert_eq!(frame2[4] & 1, 1, "frame 2 declares its checksum");
    assert_eq!(decode_frame(frame2).expect("frame 2"), big);
}

#[test]
fn recommended_input_size_tracks_the_staging_buffer() {
    let mut cx = ParallelCompressor::with_params(4, params(3, 17, false));
    cx.init_stream(None).expect("init");
    let before = cx.recommended_input_size();
    assert!(before > 0);

    let mut out = vec![0u8; 4096];
    let mut output = OutBuffer::new(&mut out);
    let data = [7u8; 1024];
    let mut input = InBuffer::new(&data);
    cx.compress_stream(&mut output, &mut input, EndDirective::Continue).expect("stream");
    assert_eq!(input.remaining(), 0);

    let after = cx.recommended_input_size();
    assert_eq!(before - after, 1024);
}

#[test]
fn exhausted_memory_budget_fails_and_resets_cleanly() {
    let data = random_bytes(2 << 20, 8);
    let mut cx = ParallelCompressor::with_memory_limit(4, params(3, 17, false), 2);
    cx.init_stream(None).expect("init");

    let mut out = vec![0u8; compress_bound(data.len())];
    let mut output = OutBuffer::new(&mut out);
    let mut failed = None;
    'feed: for slice in data.chunks(64 << 10) {
        let mut input = InBuffer::new(slice);
        while input.remaining() > 0 {
            match cx.compress_stream(&mut output, &mut input, EndDirective::Continue) {
                Ok(_) => {}
                Err(err) => {
                    failed = Some(err);
                    break 'feed;
                }
            }
        }
    }
    if failed.is_none() {
        loop {
            match cx.end_stream(&mut output) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }
    }
    assert!(
        matches!(&failed, Some(CascadeError::MemoryAllocation)),
        "expected an allocation failure, got {failed:?}"
    );

    // the frame was abandoned but the context is reusable for a frame whose
    // buffers fit the budget
    let small = random_bytes(64 << 10, 9);
    cx.reset_stream(None).expect("reset");
    let mut out = vec![0u8; compress_bound(small.len())];
    let mut output = OutBuffer::new(&mut out);
    let mut input = InBuffer::new(&small);
    while input.remaining() > 0 {
        cx.compress_stream(&mut output, &mut input, EndDirective::Continue).expect("stream");
    }
    loop {
        if cx.end_stream(&mut output).expect("end") == 0 {
            break;
        }
    }
    let written = output.pos;
    assert_eq!(decode_frame(&out[..written]).expect("round trip"), small);
}

#[test]
fn end_stream_without_input_emits_an_empty_frame() {
    let mut cx = ParallelCompressor::with_params(4, params(3, 17, true));
    cx.init_stream(None).expect("init");
    let mut out = vec![0u8; 256];
    let mut output = OutBuffer::new(&mut out);
    loop {
        if cx.end_stream(&mut output).expect("end") == 0 {
            break;
        }
    }
    let written = output.pos;
    assert_eq!(decode_frame(&out[..written]).expect("round trip"), Vec::<u8>::new());
}
