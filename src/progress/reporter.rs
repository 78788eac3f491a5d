use crate::progress::types::{ProgressEvent, ProgressEventKind};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Sink for upload progress. Implementations must not block.
pub trait ProgressReporter: Send + Sync {
    fn on_chunk_state_changed(&self, event: &ProgressEvent);

    fn on_session_state_changed(&self, event: &ProgressEvent);

    fn emit(&self, event: &ProgressEvent) {
        match event.kind {
            ProgressEventKind::ChunkState => self.on_chunk_state_changed(event),
            ProgressEventKind::SessionState => self.on_session_state_changed(event),
        }
    }
}

/// Publishes events on a broadcast channel; lagging subscribers lose the
/// oldest events.
#[derive(Clone)]
pub struct BroadcastReporter {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn publish(&self, event: &ProgressEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event.clone());
    }
}

impl ProgressReporter for BroadcastReporter {
    fn on_chunk_state_changed(&self, event: &ProgressEvent) {
        self.publish(event);
    }

    fn on_session_state_changed(&self, event: &ProgressEvent) {
        self.publish(event);
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn on_chunk_state_changed(&self, event: &ProgressEvent) {
        tracing::debug!(
            session_id = %event.session_id,
            chunk_index = event.chunk_index,
            server_id = event.server_id.as_deref(),
            status = %event.status,
            reason = event.reason.as_deref(),
            progress = event.progress_percent,
            "chunk state changed"
        );
    }

    fn on_session_state_changed(&self, event: &ProgressEvent) {
        tracing::info!(
            session_id = %event.session_id,
            status = %event.status,
            reason = event.reason.as_deref(),
            progress = event.progress_percent,
            "session state changed"
        );
    }
}

/// Forwards each event to several reporters.
#[derive(Clone, Default)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

impl ProgressReporter for FanoutReporter {
    fn on_chunk_state_changed(&self, event: &ProgressEvent) {
        for reporter in &self.reporters {
            reporter.on_chunk_state_changed(event);
        }
    }

    fn on_session_state_changed(&self, event: &ProgressEvent) {
        for reporter in &self.reporters {
            reporter.on_session_state_changed(event);
        }
    }
}
