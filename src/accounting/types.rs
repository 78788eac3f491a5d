use serde::{Deserialize, Serialize};

/// Used and maximum bytes of one backing storage account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub account_id: String,
    #[serde(default)]
    pub used_bytes: u64,
    pub max_bytes: u64,
    /// In-flight reservations; never loaded from disk.
    #[serde(default)]
    pub reserved_bytes: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl UsageRecord {
    pub fn new(account_id: impl Into<String>, max_bytes: u64) -> Self {
        Self {
            account_id: account_id.into(),
            used_bytes: 0,
            max_bytes,
            reserved_bytes: 0,
            active: true,
        }
    }

    /// Bytes still free after committed usage and outstanding reservations.
    pub fn available(&self) -> u64 {
        self.max_bytes
            .saturating_sub(self.used_bytes)
            .saturating_sub(self.reserved_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveOutcome {
    Reserved,
    /// Inactive, unknown, or the write would exceed the account maximum.
    Rejected,
}

impl ReserveOutcome {
    pub fn is_reserved(self) -> bool {
        self == ReserveOutcome::Reserved
    }
}
