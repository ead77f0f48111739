//! Shared cursor and progress types for the streaming API.

/// Directive accompanying a [`compress_stream`](crate::ParallelCompressor::compress_stream)
/// call: keep ingesting, flush what is buffered, or end the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndDirective {
    Continue,
    Flush,
    End,
}

/// Input cursor: `src[pos..]` is the data not yet consumed by the driver.
#[derive(Debug)]
pub struct InBuffer<'a> {
    pub src: &'a [u8],
    pub pos: usize,
}

impl<'a> InBuffer<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }
}

/// Output cursor: compressed bytes are appended at `dst[pos..]`.
#[derive(Debug)]
pub struct OutBuffer<'a> {
    pub dst: &'a mut [u8],
    pub pos: usize,
}

impl<'a> OutBuffer<'a> {
    pub fn new(dst: &'a mut [u8]) -> Self {
        Self { dst, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.dst.len() - self.pos
    }

    /// Appends `bytes` at the cursor. Callers clamp to [`remaining`](Self::remaining).
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        self.dst[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }
}

/// Progress counters for the frame being compressed.
///
/// `consumed` counts source bytes fully compressed, `ingested` counts source
/// bytes accepted by the driver (staged or in flight), `produced` counts
/// compressed bytes emitted so far, including bytes not yet drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameProgression {
    pub consumed: u64,
    pub ingested: u64,
    pub produced: u64,
}
