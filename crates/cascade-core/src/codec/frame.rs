use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use xxhash_rust::xxh64::{xxh64, Xxh64};

use crate::codec::{FLAG_CHECKSUM, FLAG_CONTENT_SIZE, FRAME_MAGIC, HEADER_MAX};
use crate::error::{CascadeError, Result};

/// Granularity of the compress/inflate loops below; each call to the raw
/// deflate state gets this much output room.
const IO_CHUNK: usize = 32 * 1024;

/// Reusable deflate state. Heavy to build, so the driver pools these and
/// reprimes one per job.
pub struct CompressContext {
    raw: Compress,
}

impl CompressContext {
    pub fn new() -> Self {
        Self {
            // raw deflate: the frame carries its own header and checksum
            raw: Compress::new(Compression::new(6), false),
        }
    }
}

impl Default for CompressContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame-level inputs forwarded to the codec for one chunk.
#[derive(Debug, Clone)]
pub struct FrameParams {
    pub level: u32,
    /// When set, the codec hashes everything it ingests and
    /// [`finish_frame`](FrameEncoder::finish_frame) appends the digest.
    pub checksum: bool,
    /// Pledged content size; `None` means unknown.
    pub pledged: Option<u64>,
    /// Record the pledged size in the header when it is known.
    pub content_size_flag: bool,
}

/// A prepared raw-content dictionary, only legal for the first chunk of a
/// frame.
#[derive(Debug, Clone)]
pub struct Dictionary(Vec<u8>);

impl Dictionary {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Compresses one chunk of a frame.
///
/// The encoder owns its context for the duration of the chunk and hands it
/// back through [`into_context`](Self::into_context) so the pool can reuse it.
pub struct FrameEncoder {
    ctx: CompressContext,
    hash: Option<Xxh64>,
}

impl FrameEncoder {
    /// Primes `ctx` for one chunk. `dict` is the overlap prefix (or a
    /// prepared dictionary for the first chunk); the frame header is written
    /// to `out` iff `first_chunk`.
    pub fn begin(
        mut ctx: CompressContext,
        params: &FrameParams,
        dict: &[u8],
        first_chunk: bool,
        out: &mut Vec<u8>,
    ) -> Result<Self> {
        ctx.raw.reset();
        ctx.raw
            .set_level(Compression::new(params.level.min(9)))
            .map_err(|e| CascadeError::Compression(e.to_string()))?;
        if !dict.is_empty() {
            ctx.raw
                .set_dictionary(dict)
                .map_err(|e| CascadeError::Compression(e.to_string()))?;
        }

        if first_chunk {
            out.extend_from_slice(&FRAME_MAGIC);
            let content = if params.content_size_flag {
                params.pledged
            } else {
                None
            };
            let mut flags = 0u8;
            if params.checksum {
                flags |= FLAG_CHECKSUM;
            }
            if content.is_some() {
                flags |= FLAG_CONTENT_SIZE;
            }
            out.push(flags);
            if let Some(n) = content {
                out.extend_from_slice(&n.to_le_bytes());
            }
        }

        Ok(Self {
            ctx,
            hash: params.checksum.then(|| Xxh64::new(0)),
        })
    }

    /// Continue-compresses `src`; output may be withheld until a later flush.
    pub fn write_block(&mut self, out: &mut Vec<u8>, src: &[u8]) -> Result<usize> {
        if let Some(hash) = &mut self.hash {
            hash.update(src);
        }
        self.run(out, src, FlushCompress::None, false)
    }

    /// Last block of a chunk that does not end the frame: compresses `src`
    /// and sync-flushes so the chunk's output ends on a byte boundary.
    pub fn sync_chunk(&mut self, out: &mut Vec<u8>, src: &[u8]) -> Result<usize> {
        if let Some(hash) = &mut self.hash {
            hash.update(src);
        }
        self.run(out, src, FlushCompress::Sync, false)
    }

    /// Last block of the frame: emits the terminator and, when the context
    /// carries the checksum flag, the 4-byte digest suffix.
    pub fn finish_frame(&mut self, out: &mut Vec<u8>, src: &[u8]) -> Result<usize> {
        if let Some(hash) = &mut self.hash {
            hash.update(src);
        }
        let mut produced = self.run(out, src, FlushCompress::Finish, true)?;
        if let Some(hash) = &self.hash {
            let digest = (hash.digest() & 0xFFFF_FFFF) as u32;
            out.extend_from_slice(&digest.to_le_bytes());
            produced += 4;
        }
        Ok(produced)
    }

    /// Releases the underlying context for reuse.
    pub fn into_context(self) -> CompressContext {
        self.ctx
    }

    fn run(
        &mut self,
        out: &mut Vec<u8>,
        mut src: &[u8],
        flush: FlushCompress,
        until_end: bool,
    ) -> Result<usize> {
        let mut produced = 0usize;
        loop {
            let spare_at = out.len();
            out.resize(spare_at + IO_CHUNK, 0);
            let before_in = self.ctx.raw.total_in();
            let before_out = self.ctx.raw.total_out();
            let status = self
                .ctx
                .raw
                .compress(src, &mut out[spare_at..], flush)
                .map_err(|e| CascadeError::Compression(e.to_string()))?;
            let read = (self.ctx.raw.total_in() - before_in) as usize;
            let written = (self.ctx.raw.total_out() - before_out) as usize;
            src = &src[read..];
            out.truncate(spare_at + written);
            produced += written;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if until_end {
                        continue;
                    }
                    // output room left over means the flush settled
                    if src.is_empty() && written < IO_CHUNK {
                        break;
                    }
                }
            }
        }
        Ok(produced)
    }
}

/// Decodes one frame produced by this codec: header, inflate to the
/// terminator, then checksum and content-size verification.
pub fn decode_frame(src: &[u8]) -> Result<Vec<u8>> {
    decode_frame_inner(src, &[])
}

/// Like [`decode_frame`], for frames whose first chunk was compressed with a
/// prepared dictionary.
pub fn decode_frame_with_dictionary(src: &[u8], dict: &[u8]) -> Result<Vec<u8>> {
    decode_frame_inner(src, dict)
}

fn decode_frame_inner(src: &[u8], dict: &[u8]) -> Result<Vec<u8>> {
    if src.len() < 5 || src[..4] != FRAME_MAGIC {
        return Err(CascadeError::Decompression("bad frame header".into()));
    }
    let flags = src[4];
    let mut offset = 5;
    let declared = if flags & FLAG_CONTENT_SIZE != 0 {
        if src.len() < HEADER_MAX {
            return Err(CascadeError::Decompression("truncated frame header".into()));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&src[5..13]);
        offset = HEADER_MAX;
        Some(u64::from_le_bytes(raw))
    } else {
        None
    };

    let body = &src[offset..];
    let mut inflater = Decompress::new(false);
    if !dict.is_empty() {
        inflater
            .set_dictionary(dict)
            .map_err(|e| CascadeError::Decompression(e.to_string()))?;
    }
    let mut out = Vec::with_capacity(declared.unwrap_or(0).min(64 << 20) as usize);
    let mut consumed = 0usize;
    loop {
        out.reserve(IO_CHUNK);
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let status = inflater
            .decompress_vec(&body[consumed..], &mut out, FlushDecompress::None)
            .map_err(|e| CascadeError::Decompression(e.to_string()))?;
        let read = (inflater.total_in() - before_in) as usize;
        let written = (inflater.total_out() - before_out) as usize;
        consumed += read;
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if consumed == body.len() && read == 0 && written == 0 {
                    return Err(CascadeError::Decompression("truncated frame".into()));
                }
            }
        }
    }

    let mut trailer = &body[consumed..];
    if flags & FLAG_CHECKSUM != 0 {
        if trailer.len() < 4 {
            return Err(CascadeError::Decompression("missing frame checksum".into()));
        }
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = (xxh64(&out, 0) & 0xFFFF_FFFF) as u32;
        if expected != actual {
            return Err(CascadeError::ChecksumMismatch { expected, actual });
        }
        trailer = &trailer[4..];
    }
    if !trailer.is_empty() {
        return Err(CascadeError::Decompression(
            "trailing bytes after frame".into(),
        ));
    }
    if let Some(declared) = declared {
        if out.len() as u64 != declared {
            return Err(CascadeError::Decompression(format!(
                "content size mismatch (declared {declared}, decoded {})",
                out.len()
            )));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::compress_bound;

    fn params(level: u32, checksum: bool) -> FrameParams {
        FrameParams {
            level,
            checksum,
            pledged: None,
            content_size_flag: false,
        }
    }

    #[test]
    fn single_chunk_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(1000);
        let mut out = Vec::new();
        let mut enc =
            FrameEncoder::begin(CompressContext::new(), &params(6, true), &[], true, &mut out)
                .unwrap();
        enc.finish_frame(&mut out, &data).unwrap();

        assert!(out.len() < data.len());
        assert!(out.len() <= compress_bound(data.len()));
        assert_eq!(decode_frame(&out).unwrap(), data);
    }

    #[test]
    fn two_chunks_with_prefix_dictionary_concatenate() {
        let a: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let b: Vec<u8> = (0..200_000u32).map(|i| (i % 163) as u8).collect();

        let mut frame = Vec::new();
        let mut enc =
            FrameEncoder::begin(CompressContext::new(), &params(6, false), &[], true, &mut frame)
                .unwrap();
        enc.sync_chunk(&mut frame, &a).unwrap();
        let ctx = enc.into_context();

        // second chunk starts fresh, primed with the tail of the first
        let prefix = &a[a.len() - 32 * 1024..];
        let mut enc =
            FrameEncoder::begin(ctx, &params(6, false), prefix, false, &mut frame).unwrap();
        enc.finish_frame(&mut frame, &b).unwrap();

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(&decoded[..a.len()], &a[..]);
        assert_eq!(&decoded[a.len()..], &b[..]);
    }

    #[test]
    fn declared_content_size_is_verified() {
        let data = vec![7u8; 10_000];
        let fp = FrameParams {
            level: 3,
            checksum: false,
            pledged: Some(data.len() as u64),
            content_size_flag: true,
        };
        let mut out = Vec::new();
        let mut enc =
            FrameEncoder::begin(CompressContext::new(), &fp, &[], true, &mut out).unwrap();
        enc.finish_frame(&mut out, &data).unwrap();
        assert_eq!(decode_frame(&out).unwrap(), data);

        let wrong = FrameParams {
            pledged: Some(9_999),
            ..fp
        };
        let mut out = Vec::new();
        let mut enc =
            FrameEncoder::begin(CompressContext::new(), &wrong, &[], true, &mut out).unwrap();
        enc.finish_frame(&mut out, &data).unwrap();
        assert!(decode_frame(&out).is_err());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let data = b"checksummed payload".repeat(500);
        let mut out = Vec::new();
        let mut enc =
            FrameEncoder::begin(CompressContext::new(), &params(6, true), &[], true, &mut out)
                .unwrap();
        enc.finish_frame(&mut out, &data).unwrap();

        let last = out.len() - 1;
        out[last] ^= 0xA5;
        assert!(matches!(
            decode_frame(&out),
            Err(CascadeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn empty_frame_round_trips() {
        let mut out = Vec::new();
        let mut enc =
            FrameEncoder::begin(CompressContext::new(), &params(1, true), &[], true, &mut out)
                .unwrap();
        enc.finish_frame(&mut out, &[]).unwrap();
        assert_eq!(decode_frame(&out).unwrap(), Vec::<u8>::new());
    }
}
