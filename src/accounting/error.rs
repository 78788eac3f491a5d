use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountingError {
    #[error("Unknown storage account: {0}")]
    UnknownAccount(String),

    #[error("Invalid account record: {0}")]
    InvalidRecord(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for AccountingError {
    fn from(err: sqlx::Error) -> Self {
        AccountingError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for AccountingError {
    fn from(err: serde_json::Error) -> Self {
        AccountingError::SerializationError(err.to_string())
    }
}

pub type AccountingResult<T> = Result<T, AccountingError>;
