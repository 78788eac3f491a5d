use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Checksum mismatch for chunk {index}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("Invalid checksum length: expected 32 bytes, got {0}")]
    InvalidChecksumLength(usize),
}

pub type IntegrityResult<T> = Result<T, IntegrityError>;
