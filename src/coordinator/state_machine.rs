use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::coordinator::types::{ChunkState, SessionStatus};
use parking_lot::RwLock;
use std::sync::Arc;

/// Guards the session lifecycle
/// `preparing -> distributing -> uploading -> completed | failed`.
#[derive(Clone)]
pub struct SessionStateMachine {
    state: Arc<RwLock<SessionStatus>>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(SessionStatus::Preparing)),
        }
    }

    /// Get current state
    pub fn current_state(&self) -> SessionStatus {
        self.state.read().clone()
    }

    pub fn transition(&self, next: SessionStatus) -> CoordinatorResult<SessionStatus> {
        let mut state = self.state.write();

        let allowed = match (&*state, &next) {
            (current, _) if current.is_terminal() => false,
            (_, SessionStatus::Failed { .. }) => true,
            (SessionStatus::Preparing, SessionStatus::Distributing) => true,
            (SessionStatus::Distributing, SessionStatus::Uploading) => true,
            (SessionStatus::Uploading, SessionStatus::Completed) => true,
            _ => false,
        };

        if !allowed {
            return Err(CoordinatorError::InvalidStateTransition(format!(
                "session cannot go from {} to {}",
                state.label(),
                next.label()
            )));
        }

        *state = next.clone();
        Ok(next)
    }
}

/// Whether a chunk may move from `from` to `to`.
///
/// `uploading -> failed -> waiting` is the retry path; a failed chunk may
/// also be failed again once its retries run out.
pub fn chunk_transition_allowed(from: &ChunkState, to: &ChunkState) -> bool {
    use ChunkState::*;

    matches!(
        (from, to),
        (Pending, Waiting { .. })
            | (Pending, Uploading { .. })
            | (Pending, Failed { .. })
            | (Waiting { .. }, Waiting { .. })
            | (Waiting { .. }, Uploading { .. })
            | (Waiting { .. }, Failed { .. })
            | (Uploading { .. }, Completed { .. })
            | (Uploading { .. }, Failed { .. })
            | (Failed { .. }, Waiting { .. })
            | (Failed { .. }, Failed { .. })
    )
}
