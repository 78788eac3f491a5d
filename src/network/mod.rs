pub mod client;
pub mod error;
pub mod quic_transport;
pub mod types;

pub use client::{ChunkStoreHandler, StorageClient};
pub use error::{NetworkError, NetworkResult};
pub use quic_transport::{QuicStorageClient, QuicTransport};
pub use types::{
    ChunkUploadHeader, ConnectionConfig, NetworkStats, ServerCapabilities, ServerStatus,
    StoredChunk, WireRequest, WireResponse,
};
