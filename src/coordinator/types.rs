use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a chunk or session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No server could take the chunk within the selection timeout.
    NoCapableServer,
    RetriesExhausted,
    Cancelled,
    /// Unreadable source, size or checksum mismatch.
    InputError,
    Internal,
    /// A single dispatch failed; the chunk will be retried.
    DispatchFailed,
}

impl FailureReason {
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::NoCapableServer => "no_capable_server",
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::Cancelled => "cancelled",
            FailureReason::InputError => "input_error",
            FailureReason::Internal => "internal",
            FailureReason::DispatchFailed => "dispatch_failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Preparing,
    Distributing,
    Uploading,
    Completed,
    Failed { reason: FailureReason, message: String },
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Preparing => "preparing",
            SessionStatus::Distributing => "distributing",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed { .. })
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            SessionStatus::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Waiting {
        attempts: u32,
        excluded: Vec<String>,
    },
    Uploading {
        server_id: String,
        attempts: u32,
    },
    Completed {
        server_id: String,
        locator: String,
        attempts: u32,
    },
    Failed {
        reason: FailureReason,
        message: String,
        attempts: u32,
        excluded: Vec<String>,
    },
}

impl ChunkState {
    pub fn label(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Waiting { .. } => "waiting",
            ChunkState::Uploading { .. } => "uploading",
            ChunkState::Completed { .. } => "completed",
            ChunkState::Failed { .. } => "failed",
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ChunkState::Pending => 0,
            ChunkState::Waiting { attempts, .. }
            | ChunkState::Uploading { attempts, .. }
            | ChunkState::Completed { attempts, .. }
            | ChunkState::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ChunkState::Completed { .. })
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            ChunkState::Uploading { server_id, .. } | ChunkState::Completed { server_id, .. } => {
                Some(server_id)
            }
            _ => None,
        }
    }
}

/// Live view of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    /// Hex BLAKE3 of the chunk, once it has been read.
    pub checksum: Option<String>,
    pub state: ChunkState,
    pub last_error: Option<String>,
    /// Completed before this session started, according to the ledger.
    pub from_ledger: bool,
}

/// What the caller asks to upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    /// Opaque scope used to list partial uploads.
    pub owner: Option<String>,
}

impl UploadRequest {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, total_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            total_size,
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Point-in-time snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProgress {
    pub session_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub owner: Option<String>,
    /// Hex checksum; unknown while the file is still being hashed.
    pub checksum: Option<String>,
    pub status: SessionStatus,
    pub resuming: bool,
    pub total_size: u64,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub bytes_uploaded: u64,
    pub progress_percent: f32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub chunks: Vec<ChunkProgress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlacement {
    pub chunk_index: u32,
    pub server_id: String,
    pub locator: String,
}

/// Terminal result of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub session_id: String,
    pub checksum: Option<String>,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub status: SessionStatus,
    pub resumed: bool,
    pub progress_percent: f32,
    pub chunks: Vec<ChunkProgress>,
}

impl UploadOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.status.failure_reason()
    }

    pub fn chunk(&self, index: u32) -> Option<&ChunkProgress> {
        self.chunks.iter().find(|c| c.index == index)
    }

    /// Where each completed chunk is stored, ordered by index.
    pub fn placements(&self) -> Vec<ChunkPlacement> {
        self.chunks
            .iter()
            .filter_map(|c| match &c.state {
                ChunkState::Completed {
                    server_id, locator, ..
                } => Some(ChunkPlacement {
                    chunk_index: c.index,
                    server_id: server_id.clone(),
                    locator: locator.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_codes() {
        assert_eq!(FailureReason::NoCapableServer.code(), "no_capable_server");
        assert_eq!(FailureReason::RetriesExhausted.to_string(), "retries_exhausted");
        assert_eq!(
            serde_json::to_value(FailureReason::InputError).unwrap(),
            "input_error"
        );
    }

    #[test]
    fn test_status_serialization() {
        let status = SessionStatus::Failed {
            reason: FailureReason::Cancelled,
            message: "cancelled by caller".into(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "cancelled");
        assert!(status.is_terminal());
        assert!(!SessionStatus::Uploading.is_terminal());
    }

    #[test]
    fn test_chunk_state_attempts() {
        let state = ChunkState::Completed {
            server_id: "s1".into(),
            locator: "l".into(),
            attempts: 3,
        };
        assert_eq!(state.attempts(), 3);
        assert_eq!(state.label(), "completed");
        assert_eq!(state.server_id(), Some("s1"));
        assert_eq!(ChunkState::Pending.attempts(), 0);
    }
}
