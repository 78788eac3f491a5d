//! Seams between the coordinator and storage servers.

use crate::network::error::NetworkResult;
use crate::network::types::{ChunkUploadHeader, ServerStatus, StoredChunk};
use async_trait::async_trait;
use bytes::Bytes;

/// Outbound interface to one storage server.
#[async_trait]
pub trait StorageClient: Send + Sync {
    fn server_id(&self) -> &str;

    fn endpoint(&self) -> String;

    /// Store one chunk and return its locator.
    async fn upload_chunk(&self, header: ChunkUploadHeader, data: Bytes)
        -> NetworkResult<StoredChunk>;

    async fn server_status(&self) -> NetworkResult<ServerStatus>;
}

/// Serving side of the protocol, implemented by storage nodes.
#[async_trait]
pub trait ChunkStoreHandler: Send + Sync {
    async fn store_chunk(&self, header: ChunkUploadHeader, data: Bytes) -> Result<StoredChunk, String>;

    async fn status(&self) -> ServerStatus;
}
