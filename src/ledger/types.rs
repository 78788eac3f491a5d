use crate::chunk::FileManifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where a completed chunk ended up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkLocation {
    pub chunk_index: u32,
    pub server_id: String,
    pub locator: String,
    pub chunk_checksum: String,
    pub completed_at: DateTime<Utc>,
}

/// Durable record of a partially uploaded file, keyed by its checksum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Lowercase hex BLAKE3 of the whole file.
    pub checksum: String,
    pub file_name: String,
    pub total_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub owner: Option<String>,
    /// Completed chunks ordered by index.
    pub completed: Vec<ChunkLocation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_manifest(manifest: &FileManifest, owner: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            checksum: manifest.checksum_hex(),
            file_name: manifest.file_name.clone(),
            total_size: manifest.total_size,
            mime_type: manifest.mime_type.clone(),
            total_chunks: manifest.total_chunks,
            chunk_size: manifest.chunk_size,
            owner,
            completed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn completed_indices(&self) -> BTreeSet<u32> {
        self.completed.iter().map(|c| c.chunk_index).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() as u64 >= self.total_chunks as u64
    }

    pub fn progress_percent(&self) -> f32 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.completed.len() as f32 / self.total_chunks as f32 * 100.0
    }
}
