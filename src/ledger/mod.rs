mod error;
mod store;
mod types;

pub use error::{LedgerError, LedgerResult};
pub use store::PartialUploadLedger;
pub use types::{ChunkLocation, LedgerEntry};
