//! Development storage node: answers the QUIC chunk protocol and writes chunks
//! under a local directory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use shardstream::integrity::IntegrityVerifier;
use shardstream::network::{
    ChunkStoreHandler, ChunkUploadHeader, ConnectionConfig, QuicTransport, ServerCapabilities,
    ServerStatus, StoredChunk,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Directory-backed storage node")]
struct NodeArgs {
    /// UDP address for the QUIC endpoint
    #[arg(long, env = "STORAGE_NODE_LISTEN", default_value = "0.0.0.0:4433")]
    listen: SocketAddr,

    /// Directory chunks are written to
    #[arg(long, env = "STORAGE_NODE_DIR", default_value = "./data/node")]
    dir: PathBuf,

    /// Bytes this node may hold
    #[arg(long, env = "STORAGE_NODE_CAPACITY", default_value_t = 10 * 1024 * 1024 * 1024)]
    capacity: u64,

    /// Concurrent uploads before the node reports itself full
    #[arg(long, env = "STORAGE_NODE_MAX_LOAD", default_value_t = 16)]
    max_load: u32,

    #[arg(long, env = "STORAGE_NODE_MAX_CHUNK_SIZE", default_value_t = 64 * 1024 * 1024)]
    max_chunk_size: u64,
}

struct DirectoryStore {
    root: PathBuf,
    capacity: u64,
    max_load: u32,
    max_chunk_size: u64,
    used: AtomicU64,
    load: Arc<AtomicU32>,
    stored: AtomicU64,
    rejected: AtomicU64,
    total_store_ms: AtomicU64,
}

/// Counts one in-progress store; decremented on drop.
struct LoadSlot(Arc<AtomicU32>);

impl Drop for LoadSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DirectoryStore {
    fn open(root: PathBuf, capacity: u64, max_load: u32, max_chunk_size: u64) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        let used = directory_size(&root)?;

        Ok(Self {
            root,
            capacity,
            max_load,
            max_chunk_size,
            used: AtomicU64::new(used),
            load: Arc::new(AtomicU32::new(0)),
            stored: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            total_store_ms: AtomicU64::new(0),
        })
    }

    fn reject(&self, message: String) -> Result<StoredChunk, String> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %message, "chunk rejected");
        Err(message)
    }

    async fn write_chunk(&self, header: &ChunkUploadHeader, data: &Bytes) -> Result<String, String> {
        let file_id = IntegrityVerifier::normalize_checksum(&header.file_id)
            .map_err(|e| format!("invalid file id: {e}"))?;
        let dir = self.root.join(&file_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;

        let name = format!("{:08}.chunk", header.chunk_index);
        tokio::fs::write(dir.join(&name), data)
            .await
            .map_err(|e| format!("failed to write chunk: {e}"))?;
        Ok(format!("{file_id}/{name}"))
    }
}

#[async_trait]
impl ChunkStoreHandler for DirectoryStore {
    async fn store_chunk(&self, header: ChunkUploadHeader, data: Bytes) -> Result<StoredChunk, String> {
        self.load.fetch_add(1, Ordering::AcqRel);
        let _slot = LoadSlot(self.load.clone());
        let started = Instant::now();

        let size = data.len() as u64;
        if size != header.chunk_size {
            return self.reject(format!(
                "chunk {} is {size} bytes, header says {}",
                header.chunk_index, header.chunk_size
            ));
        }
        if size > self.max_chunk_size {
            return self.reject(format!("chunk of {size} bytes exceeds {}", self.max_chunk_size));
        }
        if IntegrityVerifier::calculate_checksum(&data) != header.checksum {
            return self.reject(format!("checksum mismatch for chunk {}", header.chunk_index));
        }

        let reserved = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= self.capacity)
            })
            .is_ok();
        if !reserved {
            return self.reject("insufficient space".to_string());
        }

        match self.write_chunk(&header, &data).await {
            Ok(locator) => {
                self.stored.fetch_add(1, Ordering::Relaxed);
                self.total_store_ms
                    .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                tracing::debug!(
                    file_id = %header.file_id,
                    chunk_index = header.chunk_index,
                    size,
                    "chunk stored"
                );
                Ok(StoredChunk { locator })
            }
            Err(e) => {
                self.used.fetch_sub(size, Ordering::AcqRel);
                self.reject(e)
            }
        }
    }

    async fn status(&self) -> ServerStatus {
        let stored = self.stored.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let total = stored + rejected;

        ServerStatus {
            active: true,
            current_load: self.load.load(Ordering::Acquire),
            max_load: self.max_load,
            capabilities: ServerCapabilities {
                max_chunk_size: self.max_chunk_size,
                free_space: self.capacity.saturating_sub(self.used.load(Ordering::Acquire)),
                supported_formats: vec!["*".to_string()],
            },
            response_time_ms: if stored == 0 {
                0
            } else {
                self.total_store_ms.load(Ordering::Relaxed) / stored
            },
            success_rate: if total == 0 {
                1.0
            } else {
                stored as f32 / total as f32
            },
        }
    }
}

/// Bytes already held under `root`, one level of file directories deep.
fn directory_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        for chunk in std::fs::read_dir(entry.path())? {
            total += chunk?.metadata()?.len();
        }
    }
    Ok(total)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let store = DirectoryStore::open(args.dir.clone(), args.capacity, args.max_load, args.max_chunk_size)?;
    let used = store.used.load(Ordering::Acquire);

    let transport = Arc::new(
        QuicTransport::new(ConnectionConfig {
            bind_addr: args.listen,
            max_body_size: args.max_chunk_size as usize,
            ..Default::default()
        })
        .await
        .context("failed to create QUIC endpoint")?,
    );

    tracing::info!(
        addr = %transport.local_addr()?,
        dir = %args.dir.display(),
        capacity = args.capacity,
        used,
        "storage node listening"
    );

    tokio::select! {
        result = transport.clone().serve(Arc::new(store)) => {
            result.context("storage node stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            transport.close();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(data: &[u8], index: u32) -> ChunkUploadHeader {
        ChunkUploadHeader {
            file_id: hex::encode([3u8; 32]),
            file_name: "f.bin".into(),
            mime_type: "application/octet-stream".into(),
            chunk_index: index,
            total_chunks: 2,
            chunk_size: data.len() as u64,
            checksum: IntegrityVerifier::calculate_checksum(data),
        }
    }

    #[tokio::test]
    async fn test_store_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path().to_path_buf(), 100, 4, 64).unwrap();

        let data = Bytes::from_static(b"hello chunk");
        let stored = store.store_chunk(header(&data, 1), data.clone()).await.unwrap();
        assert!(stored.locator.ends_with("00000001.chunk"));
        assert_eq!(std::fs::read(dir.path().join(&stored.locator)).unwrap(), data);

        let status = store.status().await;
        assert_eq!(status.current_load, 0);
        assert_eq!(status.capabilities.free_space, 100 - data.len() as u64);

        // Reopening counts what is already on disk.
        let reopened = DirectoryStore::open(dir.path().to_path_buf(), 100, 4, 64).unwrap();
        assert_eq!(reopened.used.load(Ordering::Acquire), data.len() as u64);
    }

    #[tokio::test]
    async fn test_rejects_corrupt_and_oversized_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path().to_path_buf(), 16, 4, 64).unwrap();

        let data = Bytes::from_static(b"payload");
        let mut bad = header(&data, 0);
        bad.checksum = [0u8; 32];
        assert!(store.store_chunk(bad, data.clone()).await.is_err());

        let big = Bytes::from(vec![1u8; 20]);
        let err = store.store_chunk(header(&big, 0), big).await.unwrap_err();
        assert!(err.contains("insufficient space"));

        let status = store.status().await;
        assert_eq!(status.success_rate, 0.0);
    }
}
