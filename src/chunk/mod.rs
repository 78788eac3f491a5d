pub mod chunker;
pub mod error;
pub mod types;

pub use chunker::{ChunkPlan, ChunkStream, Chunker};
pub use error::{ChunkError, Result};
pub use types::{Checksum, ChunkDescriptor, ChunkPayload, FileManifest};
