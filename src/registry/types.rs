use crate::network::ServerCapabilities;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Static registration of a storage server, as listed in the servers file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerRegistration {
    pub id: String,
    pub endpoint: String,
    pub account_id: String,
    #[serde(default)]
    pub region: Option<String>,
}

/// Best known snapshot of a storage server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerDescriptor {
    pub id: String,
    pub endpoint: String,
    pub account_id: String,
    pub region: Option<String>,
    pub active: bool,
    pub current_load: u32,
    pub max_load: u32,
    pub capabilities: ServerCapabilities,
    pub response_time_ms: u64,
    pub success_rate: f32,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl ServerDescriptor {
    pub fn has_free_slot(&self) -> bool {
        self.current_load < self.max_load
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectionConstraints {
    pub min_free_space: u64,
    pub excluded: HashSet<String>,
    pub preferred_region: Option<String>,
}

impl SelectionConstraints {
    pub fn new(min_free_space: u64) -> Self {
        Self {
            min_free_space,
            ..Default::default()
        }
    }

    pub fn excluding(mut self, excluded: impl IntoIterator<Item = String>) -> Self {
        self.excluded.extend(excluded);
        self
    }

    pub fn in_region(mut self, region: Option<String>) -> Self {
        self.preferred_region = region;
        self
    }
}
