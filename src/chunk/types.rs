use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// BLAKE3 digest.
pub type Checksum = [u8; 32];

/// One contiguous slice of a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    pub checksum: Checksum,
}

impl ChunkDescriptor {
    /// Exclusive end of the byte range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub descriptor: ChunkDescriptor,
    pub data: Bytes,
}

impl ChunkPayload {
    pub fn index(&self) -> u32 {
        self.descriptor.index
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileManifest {
    /// Stable identifier sent to storage servers; the hex checksum, so it
    /// survives resumes.
    pub file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub checksum: Checksum, // whole-file BLAKE3
}

impl FileManifest {
    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }
}
