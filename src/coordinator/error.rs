use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    #[error("Partial upload not found: {0}")]
    PartialUploadNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Upload already in progress for {0}")]
    AlreadyInProgress(String),

    #[error("Upload session ended without an outcome: {0}")]
    OutcomeLost(String),

    #[error("Coordinator is shutting down")]
    ShuttingDown,

    #[error("Invalid upload request: {0}")]
    InvalidRequest(String),

    #[error("Chunk error: {0}")]
    ChunkError(#[from] crate::chunk::ChunkError),

    #[error("Ledger error: {0}")]
    LedgerError(#[from] crate::ledger::LedgerError),

    #[error("Accounting error: {0}")]
    AccountingError(#[from] crate::accounting::AccountingError),

    #[error("Integrity error: {0}")]
    IntegrityError(#[from] crate::integrity::IntegrityError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
