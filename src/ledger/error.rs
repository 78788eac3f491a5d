use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Partial upload not found: {0}")]
    NotFound(String),

    #[error("Checksum {checksum} is recorded with size {recorded}, got {actual}")]
    SizeMismatch {
        checksum: String,
        recorded: u64,
        actual: u64,
    },

    #[error("Partial upload {0} conflicts with the recorded chunk layout")]
    LayoutConflict(String),

    #[error("Chunk index {index} out of range for {checksum} ({total_chunks} chunks)")]
    InvalidChunkIndex {
        checksum: String,
        index: u32,
        total_chunks: u32,
    },

    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::DatabaseError(err.to_string())
    }
}

impl From<crate::integrity::IntegrityError> for LedgerError {
    fn from(err: crate::integrity::IntegrityError) -> Self {
        LedgerError::InvalidChecksum(err.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
