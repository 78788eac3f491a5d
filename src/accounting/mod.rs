mod accountant;
mod error;
mod types;

pub use accountant::CapacityAccountant;
pub use error::{AccountingError, AccountingResult};
pub use types::{ReserveOutcome, UsageRecord};
