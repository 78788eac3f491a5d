use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    ChunkState,
    SessionState,
}

/// One state change of an upload session or of one of its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(rename = "type")]
    pub kind: ProgressEventKind,
    /// Lowercase state label, e.g. `uploading` or `completed`.
    pub status: String,
    pub progress_percent: f32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl ProgressEvent {
    pub fn chunk(
        session_id: &str,
        chunk_index: u32,
        status: impl Into<String>,
        progress_percent: f32,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            chunk_index: Some(chunk_index),
            kind: ProgressEventKind::ChunkState,
            status: status.into(),
            progress_percent,
            timestamp: Utc::now(),
            reason: None,
            server_id: None,
        }
    }

    pub fn session(session_id: &str, status: impl Into<String>, progress_percent: f32) -> Self {
        Self {
            session_id: session_id.to_string(),
            chunk_index: None,
            kind: ProgressEventKind::SessionState,
            status: status.into(),
            progress_percent,
            timestamp: Utc::now(),
            reason: None,
            server_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }
}
