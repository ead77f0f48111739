use thiserror::Error;

pub type Result<T> = std::result::Result<T, CascadeError>;

#[derive(Debug, Clone, Error)]
pub enum CascadeError {
    #[error("memory allocation failed (buffer pool exhausted)")]
    MemoryAllocation,
    #[error("destination buffer too small")]
    DstSizeTooSmall,
    #[error("parameter unsupported")]
    ParameterUnsupported,
    #[error("operation not permitted at this stage of the frame")]
    StageWrong,
    #[error("dictionary required but absent")]
    DictionaryWrong,
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("checksum mismatch (expected {expected:#010x}, actual {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
}
