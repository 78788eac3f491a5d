use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Server already registered: {0}")]
    DuplicateServer(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Invalid server list: {0}")]
    InvalidServerList(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::InvalidServerList(err.to_string())
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
