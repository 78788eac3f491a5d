use crate::coordinator::SessionProgress;
use crate::ledger::LedgerEntry;
use crate::registry::ServerDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartUploadResponse {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListUploadsResponse {
    pub uploads: Vec<SessionProgress>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListServersResponse {
    pub servers: Vec<ServerDescriptor>,
    pub count: usize,
}

/// Ledger entry without the per-chunk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialUploadSummary {
    pub checksum: String,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub progress_percent: f32,
    pub owner: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&LedgerEntry> for PartialUploadSummary {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            checksum: entry.checksum.clone(),
            file_name: entry.file_name.clone(),
            mime_type: entry.mime_type.clone(),
            total_size: entry.total_size,
            total_chunks: entry.total_chunks,
            completed_chunks: entry.completed.len() as u32,
            progress_percent: entry.progress_percent(),
            owner: entry.owner.clone(),
            updated_at: entry.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPartialUploadsResponse {
    pub partial_uploads: Vec<PartialUploadSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumableResponse {
    pub resumable: bool,
    pub checksum: String,
    pub completed_chunks: Vec<u32>,
    pub total_chunks: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizeQuery {
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub message: String,
}
