use crate::accounting::{CapacityAccountant, ReserveOutcome};
use crate::chunk::{ChunkPayload, ChunkPlan, Chunker, FileManifest};
use crate::config::UploadConfig;
use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::coordinator::retry::LinearBackoff;
use crate::coordinator::state_machine::{chunk_transition_allowed, SessionStateMachine};
use crate::coordinator::types::{
    ChunkProgress, ChunkState, FailureReason, SessionProgress, SessionStatus, UploadOutcome,
    UploadRequest,
};
use crate::integrity::IntegrityVerifier;
use crate::ledger::{ChunkLocation, LedgerEntry, LedgerError, PartialUploadLedger};
use crate::metrics::recorder::{self, InFlightChunk, SessionTimer};
use crate::network::{ChunkUploadHeader, NetworkError};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::registry::{LoadGuard, SelectionConstraints, ServerDescriptor, ServerRegistry};
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Finished sessions kept around for progress queries.
const RECENT_SESSION_LIMIT: usize = 256;

/// Why a session stopped.
#[derive(Debug, Clone)]
struct SessionFailure {
    reason: FailureReason,
    message: String,
}

impl SessionFailure {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct SessionMeta {
    file_name: String,
    mime_type: String,
    owner: Option<String>,
    total_size: u64,
    total_chunks: u32,
    checksum: Option<String>,
}

struct UploadSession {
    id: String,
    meta: RwLock<SessionMeta>,
    state: SessionStateMachine,
    resuming: AtomicBool,
    chunks: RwLock<BTreeMap<u32, ChunkProgress>>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    updated_at: RwLock<DateTime<Utc>>,
}

impl UploadSession {
    fn new(id: String, request: &UploadRequest, cancel: CancellationToken) -> Self {
        let now = Utc::now();
        Self {
            id,
            meta: RwLock::new(SessionMeta {
                file_name: request.file_name.clone(),
                mime_type: request.mime_type.clone(),
                owner: request.owner.clone(),
                total_size: request.total_size,
                total_chunks: 0,
                checksum: None,
            }),
            state: SessionStateMachine::new(),
            resuming: AtomicBool::new(false),
            chunks: RwLock::new(BTreeMap::new()),
            cancel,
            started_at: now,
            updated_at: RwLock::new(now),
        }
    }

    fn checksum(&self) -> Option<String> {
        self.meta.read().checksum.clone()
    }

    fn touch(&self) {
        *self.updated_at.write() = Utc::now();
    }

    fn init_chunks(&self, plan: &ChunkPlan, completed: &BTreeMap<u32, ChunkLocation>) {
        let mut chunks = self.chunks.write();
        chunks.clear();
        for (index, offset, size) in plan.ranges() {
            let progress = match completed.get(&index) {
                Some(location) => ChunkProgress {
                    index,
                    offset,
                    size,
                    checksum: Some(location.chunk_checksum.clone()),
                    state: ChunkState::Completed {
                        server_id: location.server_id.clone(),
                        locator: location.locator.clone(),
                        attempts: 0,
                    },
                    last_error: None,
                    from_ledger: true,
                },
                None => ChunkProgress {
                    index,
                    offset,
                    size,
                    checksum: None,
                    state: ChunkState::Pending,
                    last_error: None,
                    from_ledger: false,
                },
            };
            chunks.insert(index, progress);
        }
        self.meta.write().total_chunks = plan.total_chunks();
    }

    fn set_chunk_checksum(&self, index: u32, checksum: String) {
        if let Some(chunk) = self.chunks.write().get_mut(&index) {
            chunk.checksum = Some(checksum);
        }
    }

    /// Apply a chunk transition and build the event describing it.
    fn update_chunk(
        &self,
        index: u32,
        state: ChunkState,
        error: Option<String>,
    ) -> Option<ProgressEvent> {
        {
            let mut chunks = self.chunks.write();
            let chunk = chunks.get_mut(&index)?;
            if !chunk_transition_allowed(&chunk.state, &state) {
                tracing::warn!(
                    session_id = %self.id,
                    chunk_index = index,
                    from = chunk.state.label(),
                    to = state.label(),
                    "ignoring invalid chunk transition"
                );
                return None;
            }
            chunk.state = state.clone();
            if error.is_some() {
                chunk.last_error = error;
            }
        }
        self.touch();

        let mut event = ProgressEvent::chunk(&self.id, index, state.label(), self.progress_percent());
        if let Some(server_id) = state.server_id() {
            event = event.with_server(server_id);
        }
        if let ChunkState::Failed { reason, .. } = &state {
            event = event.with_reason(reason.code());
        }
        Some(event)
    }

    fn progress_percent(&self) -> f32 {
        let chunks = self.chunks.read();
        if chunks.is_empty() {
            return if self.state.current_state() == SessionStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        let completed = chunks.values().filter(|c| c.state.is_completed()).count();
        completed as f32 / chunks.len() as f32 * 100.0
    }

    fn snapshot(&self) -> SessionProgress {
        let meta = self.meta.read().clone();
        let chunks: Vec<ChunkProgress> = self.chunks.read().values().cloned().collect();
        let completed: Vec<&ChunkProgress> =
            chunks.iter().filter(|c| c.state.is_completed()).collect();
        let failed_chunks = chunks
            .iter()
            .filter(|c| {
                matches!(&c.state, ChunkState::Failed { reason, .. } if *reason != FailureReason::DispatchFailed)
            })
            .count() as u32;

        SessionProgress {
            session_id: self.id.clone(),
            file_name: meta.file_name,
            mime_type: meta.mime_type,
            owner: meta.owner,
            checksum: meta.checksum,
            status: self.state.current_state(),
            resuming: self.resuming.load(Ordering::Acquire),
            total_size: meta.total_size,
            total_chunks: meta.total_chunks,
            completed_chunks: completed.len() as u32,
            failed_chunks,
            bytes_uploaded: completed.iter().map(|c| c.size).sum(),
            progress_percent: self.progress_percent(),
            started_at: self.started_at,
            updated_at: *self.updated_at.read(),
            chunks,
        }
    }
}

/// Handle to a running upload session.
pub struct UploadHandle {
    session_id: String,
    outcome: oneshot::Receiver<UploadOutcome>,
}

impl UploadHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the session to reach a terminal status.
    pub async fn wait(self) -> CoordinatorResult<UploadOutcome> {
        let UploadHandle {
            session_id,
            outcome,
        } = self;
        outcome
            .await
            .map_err(|_| CoordinatorError::OutcomeLost(session_id))
    }
}

/// Drives chunked uploads across the registered storage servers.
#[derive(Clone)]
pub struct UploadCoordinator {
    config: Arc<UploadConfig>,
    registry: ServerRegistry,
    ledger: PartialUploadLedger,
    accountant: CapacityAccountant,
    reporter: Arc<dyn ProgressReporter>,

    // Live sessions
    sessions: Arc<DashMap<String, Arc<UploadSession>>>,

    // Finished sessions, for display
    recent: Arc<DashMap<String, SessionProgress>>,

    // File checksum -> session currently uploading it
    active_checksums: Arc<DashMap<String, String>>,

    shutdown: CancellationToken,

    // Session tasks, drained on shutdown
    tasks: TaskTracker,
}

impl UploadCoordinator {
    pub fn new(
        config: UploadConfig,
        registry: ServerRegistry,
        ledger: PartialUploadLedger,
        accountant: CapacityAccountant,
        reporter: Arc<dyn ProgressReporter>,
    ) -> CoordinatorResult<Self> {
        config
            .validate()
            .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            registry,
            ledger,
            accountant,
            reporter,
            sessions: Arc::new(DashMap::new()),
            recent: Arc::new(DashMap::new()),
            active_checksums: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &PartialUploadLedger {
        &self.ledger
    }

    pub fn accountant(&self) -> &CapacityAccountant {
        &self.accountant
    }

    /// Start uploading `source` in the background.
    ///
    /// If the ledger holds an incomplete upload with the same checksum and
    /// size, the session resumes it and skips the chunks already stored.
    pub fn start_upload<R>(&self, source: R, request: UploadRequest) -> CoordinatorResult<UploadHandle>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        if request.file_name.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest("file name is empty".into()));
        }
        if self.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShuttingDown);
        }
        Ok(self.spawn_session(source, request, None))
    }

    /// Upload `source` and wait for the outcome.
    pub async fn upload<R>(&self, source: R, request: UploadRequest) -> CoordinatorResult<UploadOutcome>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        self.start_upload(source, request)?.wait().await
    }

    /// Resume the partial upload recorded under `checksum`.
    ///
    /// `source` must hash to `checksum`; otherwise the session fails with an
    /// input error.
    pub async fn resume_upload<R>(
        &self,
        checksum: &str,
        source: R,
        owner: Option<String>,
    ) -> CoordinatorResult<UploadHandle>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShuttingDown);
        }
        let entry = self
            .ledger
            .find_by_checksum(checksum)
            .await?
            .ok_or_else(|| CoordinatorError::PartialUploadNotFound(checksum.to_string()))?;

        let request = UploadRequest {
            file_name: entry.file_name.clone(),
            mime_type: entry.mime_type.clone(),
            total_size: entry.total_size,
            owner: owner.or(entry.owner.clone()),
        };
        Ok(self.spawn_session(source, request, Some(entry.checksum)))
    }

    /// Stop dispatching new chunks for a session. In-flight dispatches
    /// finish or time out on their own.
    pub fn cancel_upload(&self, session_id: &str) -> CoordinatorResult<()> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| CoordinatorError::SessionNotFound(session_id.to_string()))?;

        tracing::info!(session_id, "upload cancellation requested");
        session.cancel.cancel();
        Ok(())
    }

    /// Get session progress, live or recently finished.
    pub fn progress(&self, session_id: &str) -> CoordinatorResult<SessionProgress> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(session.snapshot());
        }
        self.recent
            .get(session_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| CoordinatorError::SessionNotFound(session_id.to_string()))
    }

    /// Snapshots of all live sessions, oldest first.
    pub fn list_active(&self) -> Vec<SessionProgress> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().snapshot()).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Refresh every server's status and return the snapshot.
    pub async fn list_available_servers(&self) -> Vec<ServerDescriptor> {
        self.registry.refresh().await;
        self.registry.list()
    }

    pub async fn list_partial_uploads(
        &self,
        owner: Option<&str>,
    ) -> CoordinatorResult<Vec<LedgerEntry>> {
        Ok(self.ledger.list(owner).await?)
    }

    /// Abandon a partial upload. Refused while a session is uploading it.
    pub async fn delete_partial_upload(&self, checksum: &str) -> CoordinatorResult<bool> {
        let checksum = IntegrityVerifier::normalize_checksum(checksum)?;
        if let Some(session_id) = self.active_checksums.get(&checksum) {
            return Err(CoordinatorError::AlreadyInProgress(format!(
                "{checksum} (session {})",
                session_id.value()
            )));
        }
        Ok(self.ledger.delete(&checksum).await?)
    }

    pub async fn check_resumable(
        &self,
        checksum: &str,
        total_size: u64,
    ) -> CoordinatorResult<Option<LedgerEntry>> {
        Ok(self.ledger.check_resumable(checksum, total_size).await?)
    }

    /// Delete partial uploads untouched for longer than `retention`.
    pub async fn sweep_abandoned(&self, retention: Duration) -> CoordinatorResult<u64> {
        Ok(self.ledger.sweep_abandoned(retention).await?)
    }

    /// Cancel every live session and wait for in-flight dispatches to settle.
    ///
    /// Dispatches already sent are not aborted; each is bounded by the request
    /// timeout. Returns `false` if sessions were still running after that.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.cancel();
        self.tasks.close();

        let live = self.sessions.len();
        let drained = tokio::time::timeout(self.config.request_timeout, self.tasks.wait())
            .await
            .is_ok();
        if drained {
            tracing::info!(sessions = live, "upload sessions drained");
        } else {
            tracing::warn!(
                remaining = self.sessions.len(),
                "upload sessions still running after shutdown grace period"
            );
        }
        drained
    }

    fn spawn_session<R>(
        &self,
        source: R,
        request: UploadRequest,
        expected_checksum: Option<String>,
    ) -> UploadHandle
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(UploadSession::new(
            session_id.clone(),
            &request,
            self.shutdown.child_token(),
        ));
        self.sessions.insert(session_id.clone(), session.clone());

        let (tx, rx) = oneshot::channel();
        let coordinator = self.clone();
        self.tasks.spawn(async move {
            let outcome = coordinator
                .run_session(session, source, request, expected_checksum)
                .await;
            let _ = tx.send(outcome);
        });

        UploadHandle {
            session_id,
            outcome: rx,
        }
    }

    async fn run_session<R>(
        self,
        session: Arc<UploadSession>,
        source: R,
        request: UploadRequest,
        expected_checksum: Option<String>,
    ) -> UploadOutcome
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        let timer = SessionTimer::start(expected_checksum.is_some());
        tracing::info!(
            session_id = %session.id,
            file_name = %request.file_name,
            total_size = request.total_size,
            "upload session started"
        );
        self.emit_session(&session);

        let result = self
            .drive(&session, source, &request, expected_checksum.as_deref())
            .await;

        let status = match result {
            Ok(()) => SessionStatus::Completed,
            Err(failure) => SessionStatus::Failed {
                reason: failure.reason,
                message: failure.message,
            },
        };
        if let Err(e) = session.state.transition(status.clone()) {
            tracing::error!(session_id = %session.id, error = %e, "could not record terminal status");
        }
        session.touch();

        match &status {
            SessionStatus::Failed { reason, message } => {
                tracing::error!(
                    session_id = %session.id,
                    reason = reason.code(),
                    error = %message,
                    "upload session failed"
                );
                timer.fail(reason.code());
            }
            _ => {
                tracing::info!(
                    session_id = %session.id,
                    elapsed_ms = timer.elapsed().as_millis() as u64,
                    "upload session completed"
                );
                timer.complete();
            }
        }
        self.emit_session(&session);

        self.sessions.remove(&session.id);
        if let Some(checksum) = session.checksum() {
            self.active_checksums
                .remove_if(&checksum, |_, owner| owner == &session.id);
        }

        let snapshot = session.snapshot();
        self.remember(snapshot.clone());

        UploadOutcome {
            session_id: snapshot.session_id,
            checksum: snapshot.checksum,
            file_name: snapshot.file_name,
            total_size: snapshot.total_size,
            total_chunks: snapshot.total_chunks,
            status: snapshot.status,
            resumed: snapshot.resuming,
            progress_percent: snapshot.progress_percent,
            chunks: snapshot.chunks,
        }
    }

    async fn drive<R>(
        &self,
        session: &Arc<UploadSession>,
        source: R,
        request: &UploadRequest,
        expected_checksum: Option<&str>,
    ) -> Result<(), SessionFailure>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        let chunker = Chunker::new(self.config.chunk_size)
            .map_err(|e| SessionFailure::new(FailureReason::Internal, e.to_string()))?;

        let prepared = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => {
                return Err(SessionFailure::new(FailureReason::Cancelled, "upload cancelled"));
            }
            prepared = chunker.prepare(source, &request.file_name, &request.mime_type, request.total_size) => prepared,
        };
        let (mut manifest, mut stream) =
            prepared.map_err(|e| SessionFailure::new(FailureReason::InputError, e.to_string()))?;
        let checksum = manifest.checksum_hex();

        if let Some(expected) = expected_checksum {
            if expected != checksum {
                return Err(SessionFailure::new(
                    FailureReason::InputError,
                    format!("file checksum {checksum} does not match partial upload {expected}"),
                ));
            }
        }

        match self.active_checksums.entry(checksum.clone()) {
            Entry::Occupied(existing) => {
                return Err(SessionFailure::new(
                    FailureReason::InputError,
                    format!(
                        "file {checksum} is already being uploaded by session {}",
                        existing.get()
                    ),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(session.id.clone());
            }
        }
        session.meta.write().checksum = Some(checksum.clone());

        let existing = self
            .ledger
            .check_resumable(&checksum, manifest.total_size)
            .await
            .map_err(|e| match e {
                LedgerError::SizeMismatch { .. } => {
                    SessionFailure::new(FailureReason::InputError, e.to_string())
                }
                other => SessionFailure::new(FailureReason::Internal, other.to_string()),
            })?;

        let mut completed = BTreeMap::new();
        if let Some(entry) = existing {
            if entry.chunk_size != manifest.chunk_size {
                stream = stream
                    .replan(entry.chunk_size)
                    .await
                    .map_err(|e| SessionFailure::new(FailureReason::InputError, e.to_string()))?;
                manifest.chunk_size = entry.chunk_size;
                manifest.total_chunks = stream.plan().total_chunks();
            }
            completed = entry
                .completed
                .into_iter()
                .filter(|c| c.chunk_index < manifest.total_chunks)
                .map(|c| (c.chunk_index, c))
                .collect();

            session.resuming.store(true, Ordering::Release);
            recorder::record_chunks_skipped(completed.len());
            tracing::info!(
                session_id = %session.id,
                checksum = %checksum,
                completed = completed.len(),
                total_chunks = manifest.total_chunks,
                "resuming partial upload"
            );
        }

        self.ledger
            .create_or_update(&LedgerEntry::from_manifest(&manifest, request.owner.clone()))
            .await
            .map_err(|e| SessionFailure::new(FailureReason::Internal, e.to_string()))?;

        session.init_chunks(stream.plan(), &completed);
        self.advance(session, SessionStatus::Distributing)?;

        let mut stream = stream.skip_completed(completed.keys().copied());
        let manifest = Arc::new(manifest);
        self.advance(session, SessionStatus::Uploading)?;

        loop {
            if session.cancel.is_cancelled() {
                return Err(SessionFailure::new(FailureReason::Cancelled, "upload cancelled"));
            }

            let batch = stream
                .next_batch(self.config.max_in_flight)
                .await
                .map_err(|e| SessionFailure::new(FailureReason::InputError, e.to_string()))?;
            if batch.is_empty() {
                break;
            }

            // Fresh free-space and load figures for this batch.
            self.registry.refresh().await;

            let mut tasks = JoinSet::new();
            for chunk in batch {
                tasks.spawn(
                    self.clone()
                        .upload_chunk(session.clone(), manifest.clone(), chunk),
                );
            }

            let mut failure: Option<SessionFailure> = None;
            while let Some(joined) = tasks.join_next().await {
                let result = joined.unwrap_or_else(|e| {
                    Err(SessionFailure::new(
                        FailureReason::Internal,
                        format!("chunk task failed: {e}"),
                    ))
                });
                if let Err(chunk_failure) = result {
                    let replace = match &failure {
                        None => true,
                        Some(current) => {
                            current.reason == FailureReason::Cancelled
                                && chunk_failure.reason != FailureReason::Cancelled
                        }
                    };
                    if replace {
                        failure = Some(chunk_failure);
                    }
                }
            }

            if let Some(failure) = failure {
                return Err(failure);
            }
        }

        if let Err(e) = self.ledger.delete(&checksum).await {
            tracing::warn!(session_id = %session.id, error = %e, "failed to clear ledger entry");
        }
        Ok(())
    }

    /// Place one chunk: select, reserve, dispatch, and retry with exclusion.
    async fn upload_chunk(
        self,
        session: Arc<UploadSession>,
        manifest: Arc<FileManifest>,
        chunk: ChunkPayload,
    ) -> Result<(), SessionFailure> {
        let index = chunk.index();
        let size = chunk.size();
        let chunk_checksum = hex::encode(chunk.descriptor.checksum);
        session.set_chunk_checksum(index, chunk_checksum.clone());

        let mut excluded: HashSet<String> = HashSet::new();
        // Subset of `excluded` that failed a dispatch rather than lacking room
        let mut failed_on: HashSet<String> = HashSet::new();
        let mut backoff =
            LinearBackoff::new(self.config.retry_backoff_step, self.config.retry_ceiling);

        loop {
            if session.cancel.is_cancelled() {
                return Err(self.fail_chunk(
                    &session,
                    index,
                    FailureReason::Cancelled,
                    "upload cancelled",
                    backoff.attempts(),
                    &excluded,
                ));
            }

            let guard = self
                .wait_for_server(&session, index, size, &excluded, &failed_on, backoff.attempts())
                .await?;
            let server_id = guard.server_id().to_string();

            match self.accountant.reserve(guard.account_id(), size).await {
                Ok(ReserveOutcome::Reserved) => {}
                Ok(ReserveOutcome::Rejected) => {
                    tracing::debug!(
                        session_id = %session.id,
                        chunk_index = index,
                        server_id = %server_id,
                        account_id = guard.account_id(),
                        "account has no room for chunk, excluding server"
                    );
                    excluded.insert(server_id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session.id,
                        chunk_index = index,
                        server_id = %server_id,
                        error = %e,
                        "capacity reservation failed, excluding server"
                    );
                    excluded.insert(server_id);
                    continue;
                }
            }

            let attempt = backoff.attempts() + 1;
            self.set_chunk(
                &session,
                index,
                ChunkState::Uploading {
                    server_id: server_id.clone(),
                    attempts: attempt,
                },
                None,
            );
            recorder::record_chunk_dispatched(&server_id);

            let header = ChunkUploadHeader {
                file_id: manifest.file_id.clone(),
                file_name: manifest.file_name.clone(),
                mime_type: manifest.mime_type.clone(),
                chunk_index: index,
                total_chunks: manifest.total_chunks,
                chunk_size: size,
                checksum: chunk.descriptor.checksum,
            };

            let in_flight = InFlightChunk::start();
            let result = match tokio::time::timeout(
                self.config.request_timeout,
                guard.client().upload_chunk(header, chunk.data.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout(self.config.request_timeout)),
            };
            let elapsed = in_flight.elapsed();
            drop(in_flight);

            match result {
                Ok(stored) => {
                    self.registry.record_outcome(&server_id, true, elapsed);
                    if let Err(e) = self.accountant.commit(guard.account_id(), size).await {
                        tracing::warn!(server_id = %server_id, error = %e, "failed to commit capacity");
                    }
                    drop(guard);

                    if let Err(e) = self
                        .ledger
                        .mark_chunk_complete(
                            &manifest.checksum_hex(),
                            index,
                            &server_id,
                            &stored.locator,
                            &chunk_checksum,
                        )
                        .await
                    {
                        tracing::warn!(
                            session_id = %session.id,
                            chunk_index = index,
                            error = %e,
                            "failed to record chunk in ledger"
                        );
                    }

                    recorder::record_chunk_completed(&server_id, size, elapsed);
                    tracing::debug!(
                        session_id = %session.id,
                        chunk_index = index,
                        server_id = %server_id,
                        attempts = attempt,
                        "chunk stored"
                    );
                    self.set_chunk(
                        &session,
                        index,
                        ChunkState::Completed {
                            server_id,
                            locator: stored.locator,
                            attempts: attempt,
                        },
                        None,
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.registry.record_outcome(&server_id, false, elapsed);
                    if let Err(release_err) =
                        self.accountant.release(guard.account_id(), size).await
                    {
                        tracing::warn!(server_id = %server_id, error = %release_err, "failed to release capacity");
                    }
                    drop(guard);

                    excluded.insert(server_id.clone());
                    failed_on.insert(server_id.clone());
                    let message = format!("{server_id}: {e}");

                    let Some(wait) = backoff.next_backoff() else {
                        return Err(self.fail_chunk(
                            &session,
                            index,
                            FailureReason::RetriesExhausted,
                            message,
                            backoff.attempts(),
                            &excluded,
                        ));
                    };

                    tracing::warn!(
                        session_id = %session.id,
                        chunk_index = index,
                        server_id = %server_id,
                        attempts = backoff.attempts(),
                        error = %e,
                        "chunk dispatch failed, retrying"
                    );
                    recorder::record_chunk_retry();
                    self.set_chunk(
                        &session,
                        index,
                        ChunkState::Failed {
                            reason: FailureReason::DispatchFailed,
                            message: message.clone(),
                            attempts: backoff.attempts(),
                            excluded: sorted(&excluded),
                        },
                        Some(message),
                    );

                    tokio::select! {
                        _ = session.cancel.cancelled() => {
                            return Err(self.fail_chunk(
                                &session,
                                index,
                                FailureReason::Cancelled,
                                "upload cancelled",
                                backoff.attempts(),
                                &excluded,
                            ));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }

                    self.set_chunk(
                        &session,
                        index,
                        ChunkState::Waiting {
                            attempts: backoff.attempts(),
                            excluded: sorted(&excluded),
                        },
                        None,
                    );
                }
            }
        }
    }

    /// Select a server, waiting for one to qualify up to the selection
    /// timeout.
    ///
    /// If every server that could take the chunk has already failed it, the
    /// chunk fails at once with `RetriesExhausted`.
    async fn wait_for_server(
        &self,
        session: &UploadSession,
        index: u32,
        size: u64,
        excluded: &HashSet<String>,
        failed_on: &HashSet<String>,
        attempts: u32,
    ) -> Result<LoadGuard, SessionFailure> {
        let constraints = SelectionConstraints::new(self.config.required_free_space(size))
            .excluding(excluded.iter().cloned())
            .in_region(self.config.region.clone());

        if let Some(guard) = self.registry.select_server(size, &constraints) {
            return Ok(guard);
        }

        if !failed_on.is_empty() && !self.has_untried_server(size, excluded) {
            return Err(self.fail_chunk(
                session,
                index,
                FailureReason::RetriesExhausted,
                format!(
                    "every server able to take the chunk failed it: {}",
                    sorted(failed_on).join(", ")
                ),
                attempts,
                excluded,
            ));
        }

        tracing::debug!(
            session_id = %session.id,
            chunk_index = index,
            excluded = excluded.len(),
            "no capable server, waiting"
        );
        self.set_chunk(
            session,
            index,
            ChunkState::Waiting {
                attempts,
                excluded: sorted(excluded),
            },
            None,
        );

        let deadline = tokio::time::Instant::now() + self.config.selection_timeout;
        loop {
            self.registry.refresh().await;
            if let Some(guard) = self.registry.select_server(size, &constraints) {
                return Ok(guard);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(self.fail_chunk(
                    session,
                    index,
                    FailureReason::NoCapableServer,
                    format!(
                        "no server could take a {size}-byte chunk within {:?}",
                        self.config.selection_timeout
                    ),
                    attempts,
                    excluded,
                ));
            }

            let wait = self.config.selection_poll_interval.min(deadline - now);
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    return Err(self.fail_chunk(
                        session,
                        index,
                        FailureReason::Cancelled,
                        "upload cancelled",
                        attempts,
                        excluded,
                    ));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Whether some registered server outside `excluded` could ever take a
    /// chunk of `size` bytes, regardless of its current load or free space.
    fn has_untried_server(&self, size: u64, excluded: &HashSet<String>) -> bool {
        self.registry
            .list()
            .iter()
            .any(|server| !excluded.contains(&server.id) && server.capabilities.max_chunk_size >= size)
    }

    fn fail_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        reason: FailureReason,
        message: impl Into<String>,
        attempts: u32,
        excluded: &HashSet<String>,
    ) -> SessionFailure {
        let message = message.into();
        recorder::record_chunk_failed(reason.code());
        self.set_chunk(
            session,
            index,
            ChunkState::Failed {
                reason,
                message: message.clone(),
                attempts,
                excluded: sorted(excluded),
            },
            Some(message.clone()),
        );
        SessionFailure::new(reason, format!("chunk {index}: {message}"))
    }

    fn set_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        state: ChunkState,
        error: Option<String>,
    ) {
        if let Some(event) = session.update_chunk(index, state, error) {
            self.reporter.emit(&event);
        }
    }

    fn advance(&self, session: &UploadSession, status: SessionStatus) -> Result<(), SessionFailure> {
        session
            .state
            .transition(status)
            .map_err(|e| SessionFailure::new(FailureReason::Internal, e.to_string()))?;
        session.touch();
        self.emit_session(session);
        Ok(())
    }

    fn emit_session(&self, session: &UploadSession) {
        let status = session.state.current_state();
        let mut event =
            ProgressEvent::session(&session.id, status.label(), session.progress_percent());
        if let Some(reason) = status.failure_reason() {
            event = event.with_reason(reason.code());
        }
        self.reporter.emit(&event);
    }

    fn remember(&self, snapshot: SessionProgress) {
        self.recent.insert(snapshot.session_id.clone(), snapshot);
        if self.recent.len() > RECENT_SESSION_LIMIT {
            let oldest = self
                .recent
                .iter()
                .min_by_key(|e| e.value().updated_at)
                .map(|e| e.key().clone());
            if let Some(oldest) = oldest {
                self.recent.remove(&oldest);
            }
        }
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut items: Vec<String> = set.iter().cloned().collect();
    items.sort();
    items
}
