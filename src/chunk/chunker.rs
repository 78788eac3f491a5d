use std::collections::BTreeSet;
use std::io::SeekFrom;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use super::error::{ChunkError, Result};
use super::types::{ChunkDescriptor, ChunkPayload, FileManifest};
use crate::integrity::IntegrityVerifier;

/// Byte ranges for a file of `total_size` split into `chunk_size` pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidChunkSize("chunk size must be > 0".into()));
        }
        let count = total_size.div_ceil(chunk_size);
        let total_chunks = u32::try_from(count).map_err(|_| ChunkError::TooManyChunks {
            total_size,
            chunk_size,
        })?;
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// `(offset, size)` of chunk `index`, or `None` past the end.
    pub fn range(&self, index: u32) -> Option<(u64, u64)> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index as u64 * self.chunk_size;
        let size = std::cmp::min(self.chunk_size, self.total_size - offset);
        Some((offset, size))
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u32, u64, u64)> + '_ {
        (0..self.total_chunks).filter_map(move |i| self.range(i).map(|(o, s)| (i, o, s)))
    }
}

/// Splits seekable byte sources into fixed-size chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidChunkSize("chunk size must be > 0".into()));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Hash the whole source from the start and build its manifest.
    ///
    /// The source is left rewound and wrapped in a [`ChunkStream`]. A
    /// `declared_size` that differs from the bytes actually read is an input
    /// error.
    pub async fn prepare<R>(
        &self,
        mut source: R,
        file_name: &str,
        mime_type: &str,
        declared_size: u64,
    ) -> Result<(FileManifest, ChunkStream<R>)>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        source.seek(SeekFrom::Start(0)).await?;
        let (checksum, actual) = IntegrityVerifier::calculate_reader_checksum(&mut source).await?;
        if actual != declared_size {
            return Err(ChunkError::SizeMismatch {
                declared: declared_size,
                actual,
            });
        }

        let plan = ChunkPlan::new(actual, self.chunk_size as u64)?;
        let manifest = FileManifest {
            file_id: hex::encode(checksum),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            total_size: actual,
            chunk_size: plan.chunk_size(),
            total_chunks: plan.total_chunks(),
            checksum,
        };

        let mut stream = ChunkStream::new(source, plan);
        stream.rewind().await?;
        Ok((manifest, stream))
    }
}

/// Lazy, restartable sequence of chunk payloads read from `R`.
pub struct ChunkStream<R> {
    source: R,
    plan: ChunkPlan,
    next_index: u32,
    skip: BTreeSet<u32>,
    position: u64,
}

impl<R> ChunkStream<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    pub fn new(source: R, plan: ChunkPlan) -> Self {
        Self {
            source,
            plan,
            next_index: 0,
            skip: BTreeSet::new(),
            position: u64::MAX,
        }
    }

    /// Exclude indices that are already stored.
    pub fn skip_completed(mut self, completed: impl IntoIterator<Item = u32>) -> Self {
        self.skip.extend(completed);
        self
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// Re-split the same source with another chunk size and start over.
    pub async fn replan(mut self, chunk_size: u64) -> Result<Self> {
        let plan = ChunkPlan::new(self.plan.total_size(), chunk_size)?;
        self.rewind().await?;
        self.plan = plan;
        self.skip.clear();
        Ok(self)
    }

    /// Indices this stream will still yield.
    pub fn remaining(&self) -> Vec<u32> {
        (self.next_index..self.plan.total_chunks())
            .filter(|i| !self.skip.contains(i))
            .collect()
    }

    /// Restart from chunk 0.
    pub async fn rewind(&mut self) -> Result<()> {
        self.source.seek(SeekFrom::Start(0)).await?;
        self.position = 0;
        self.next_index = 0;
        Ok(())
    }

    pub async fn next_chunk(&mut self) -> Result<Option<ChunkPayload>> {
        while self.skip.contains(&self.next_index) {
            self.next_index += 1;
        }

        let index = self.next_index;
        let Some((offset, size)) = self.plan.range(index) else {
            return Ok(None);
        };

        if self.position != offset {
            self.source.seek(SeekFrom::Start(offset)).await?;
        }

        let mut buf = vec![0u8; size as usize];
        self.source.read_exact(&mut buf).await?;
        self.position = offset + size;
        self.next_index += 1;

        let checksum = IntegrityVerifier::calculate_checksum(&buf);
        Ok(Some(ChunkPayload {
            descriptor: ChunkDescriptor {
                index,
                offset,
                size,
                checksum,
            },
            data: Bytes::from(buf),
        }))
    }

    /// Read up to `max` chunks.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<ChunkPayload>> {
        let mut batch = Vec::with_capacity(max);
        while batch.len() < max {
            match self.next_chunk().await? {
                Some(chunk) => batch.push(chunk),
                None => break,
            }
        }
        Ok(batch)
    }
}
