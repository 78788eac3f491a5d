use crate::chunk::Checksum;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Declared capabilities of a storage server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerCapabilities {
    pub max_chunk_size: u64,
    pub free_space: u64,
    pub supported_formats: Vec<String>,
}

/// Self-reported status returned by `server_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerStatus {
    pub active: bool,
    pub current_load: u32,
    pub max_load: u32,
    pub capabilities: ServerCapabilities,
    pub response_time_ms: u64,
    pub success_rate: f32,
}

/// Everything a storage server needs alongside the chunk bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkUploadHeader {
    pub file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub checksum: Checksum,
}

/// Stable locator for a stored chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredChunk {
    pub locator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireRequest {
    Status,
    UploadChunk(ChunkUploadHeader),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireResponse {
    Status(ServerStatus),
    Stored(StoredChunk),
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub bind_addr: SocketAddr,
    pub max_idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub max_concurrent_streams: u32,
    /// Largest request body accepted by the serving side.
    pub max_body_size: usize,
    /// Accept any server certificate (self-signed development nodes).
    pub insecure_skip_verify: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            max_idle_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(5),
            max_concurrent_streams: 100,
            max_body_size: 64 * 1024 * 1024,
            insecure_skip_verify: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub requests_sent: u64,
    pub requests_served: u64,
    pub active_connections: usize,
}
