use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Declared size {declared} does not match {actual} bytes read")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("File of {total_size} bytes needs more than u32::MAX chunks of {chunk_size} bytes")]
    TooManyChunks { total_size: u64, chunk_size: u64 },

    #[error("Checksum mismatch for file {file_id}")]
    ChecksumMismatch { file_id: String },
}

pub type Result<T> = std::result::Result<T, ChunkError>;
