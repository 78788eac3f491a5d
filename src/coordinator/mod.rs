mod coordinator;
mod error;
mod retry;
mod state_machine;
mod types;

pub use coordinator::{UploadCoordinator, UploadHandle};
pub use error::{CoordinatorError, CoordinatorResult};
pub use retry::LinearBackoff;
pub use state_machine::{chunk_transition_allowed, SessionStateMachine};
pub use types::{
    ChunkPlacement, ChunkProgress, ChunkState, FailureReason, SessionProgress, SessionStatus,
    UploadOutcome, UploadRequest,
};
