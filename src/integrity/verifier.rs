use crate::chunk::{Checksum, ChunkPayload};
use crate::integrity::error::{IntegrityError, IntegrityResult};
use blake3::Hasher;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Calculate BLAKE3 checksum for byte slice
    pub fn calculate_checksum(data: &[u8]) -> Checksum {
        let mut hasher = Hasher::new();
        hasher.update(data);
        *hasher.finalize().as_bytes()
    }

    /// Stream a reader to the end, returning its checksum and length.
    pub async fn calculate_reader_checksum<R>(reader: &mut R) -> std::io::Result<(Checksum, u64)>
    where
        R: AsyncRead + Unpin,
    {
        let mut hasher = Hasher::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            total += n as u64;
        }

        Ok((*hasher.finalize().as_bytes(), total))
    }

    /// Verify that a payload still matches its descriptor.
    pub fn verify_chunk(chunk: &ChunkPayload) -> IntegrityResult<()> {
        let calculated = Self::calculate_checksum(&chunk.data);
        if chunk.data.len() as u64 != chunk.descriptor.size
            || calculated != chunk.descriptor.checksum
        {
            return Err(IntegrityError::ChecksumMismatch {
                index: chunk.descriptor.index,
                expected: hex::encode(chunk.descriptor.checksum),
                actual: hex::encode(calculated),
            });
        }
        Ok(())
    }

    /// Parse a lowercase or uppercase hex checksum.
    pub fn parse_checksum(value: &str) -> IntegrityResult<Checksum> {
        let bytes =
            hex::decode(value).map_err(|e| IntegrityError::InvalidChecksum(e.to_string()))?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| IntegrityError::InvalidChecksumLength(len))
    }

    /// Canonical (lowercase hex) form of a checksum string.
    pub fn normalize_checksum(value: &str) -> IntegrityResult<String> {
        Self::parse_checksum(value).map(hex::encode)
    }
}
