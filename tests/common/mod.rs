//! Scripted storage servers and a coordinator harness shared by the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use shardstream::accounting::{CapacityAccountant, UsageRecord};
use shardstream::config::UploadConfig;
use shardstream::coordinator::{UploadCoordinator, UploadOutcome};
use shardstream::ledger::PartialUploadLedger;
use shardstream::network::{
    ChunkUploadHeader, NetworkError, NetworkResult, ServerCapabilities, ServerStatus,
    StorageClient, StoredChunk,
};
use shardstream::progress::{BroadcastReporter, FanoutReporter, ProgressEvent, ProgressReporter};
use shardstream::registry::{ServerRegistration, ServerRegistry};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, SeekFrom};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

pub const ACCOUNT_QUOTA: u64 = 1 << 40;

/// Failures to inject per chunk index, shared by every server so a chunk can
/// fail on one server and succeed on the next.
#[derive(Default)]
pub struct FailureScript {
    remaining: Mutex<HashMap<u32, u32>>,
}

impl FailureScript {
    pub fn fail_chunk(&self, index: u32, times: u32) {
        self.remaining.lock().insert(index, times);
    }

    fn should_fail(&self, index: u32) -> bool {
        let mut remaining = self.remaining.lock();
        match remaining.get_mut(&index) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

/// In-memory storage server driven by the test.
pub struct ScriptedClient {
    id: String,
    free_space: AtomicU64,
    max_load: u32,
    consume_space: bool,
    always_fail: AtomicBool,
    delay: Duration,
    script: Option<Arc<FailureScript>>,
    attempts: AtomicUsize,
    attempts_by_chunk: Mutex<BTreeMap<u32, usize>>,
    stored: Mutex<HashMap<String, Bytes>>,
}

impl ScriptedClient {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            free_space: AtomicU64::new(1 << 30),
            max_load: 8,
            consume_space: false,
            always_fail: AtomicBool::new(false),
            delay: Duration::ZERO,
            script: None,
            attempts: AtomicUsize::new(0),
            attempts_by_chunk: Mutex::new(BTreeMap::new()),
            stored: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_free_space(self, bytes: u64) -> Self {
        self.free_space.store(bytes, Ordering::SeqCst);
        self
    }

    /// Reported free space shrinks by every stored chunk.
    pub fn consuming_space(mut self) -> Self {
        self.consume_space = true;
        self
    }

    pub fn failing(self) -> Self {
        self.always_fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_script(mut self, script: Arc<FailureScript>) -> Self {
        self.script = Some(script);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_free_space(&self, bytes: u64) {
        self.free_space.store(bytes, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, index: u32) -> usize {
        self.attempts_by_chunk.lock().get(&index).copied().unwrap_or(0)
    }

    pub fn stored_count(&self) -> usize {
        self.stored.lock().len()
    }

    pub fn fetch(&self, locator: &str) -> Option<Bytes> {
        self.stored.lock().get(locator).cloned()
    }
}

#[async_trait]
impl StorageClient for ScriptedClient {
    fn server_id(&self) -> &str {
        &self.id
    }

    fn endpoint(&self) -> String {
        format!("{}.test:4433", self.id)
    }

    async fn upload_chunk(
        &self,
        header: ChunkUploadHeader,
        data: Bytes,
    ) -> NetworkResult<StoredChunk> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self
            .attempts_by_chunk
            .lock()
            .entry(header.chunk_index)
            .or_default() += 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(NetworkError::Rejected(format!("{} is broken", self.id)));
        }
        if let Some(script) = &self.script {
            if script.should_fail(header.chunk_index) {
                return Err(NetworkError::ConnectionFailed("scripted failure".into()));
            }
        }
        assert_eq!(data.len() as u64, header.chunk_size);

        if self.consume_space {
            let size = data.len() as u64;
            let _ = self
                .free_space
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |free| {
                    Some(free.saturating_sub(size))
                });
        }

        let locator = format!("{}/{}/{}", self.id, header.file_id, header.chunk_index);
        self.stored.lock().insert(locator.clone(), data);
        Ok(StoredChunk { locator })
    }

    async fn server_status(&self) -> NetworkResult<ServerStatus> {
        Ok(ServerStatus {
            active: true,
            current_load: 0,
            max_load: self.max_load,
            capabilities: ServerCapabilities {
                max_chunk_size: 64 * 1024 * 1024,
                free_space: self.free_space.load(Ordering::SeqCst),
                supported_formats: vec!["*".into()],
            },
            response_time_ms: 10,
            success_rate: 1.0,
        })
    }
}

/// In-memory source whose reads fail once `fail_after` bytes have been read
/// in total, across rewinds.
pub struct FailingReader {
    inner: Cursor<Vec<u8>>,
    fail_after: u64,
    read: u64,
}

impl FailingReader {
    pub fn new(data: Vec<u8>, fail_after: u64) -> Self {
        Self {
            inner: Cursor::new(data),
            fail_after,
            read: 0,
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let allowed = self.fail_after.saturating_sub(self.read) as usize;
        if allowed == 0 && buf.remaining() > 0 {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "device went away",
            )));
        }

        let mut scratch = vec![0u8; allowed.min(buf.remaining())];
        let mut limited = ReadBuf::new(&mut scratch);
        match Pin::new(&mut self.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let filled = limited.filled().len();
                buf.put_slice(limited.filled());
                self.read += filled as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncSeek for FailingReader {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

/// Keeps every emitted event for later assertions.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Session-level statuses of one session, in emission order.
    pub fn session_statuses(&self, session_id: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id && e.chunk_index.is_none())
            .map(|e| e.status.clone())
            .collect()
    }

    pub fn chunk_events(&self, session_id: &str, index: u32) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id && e.chunk_index == Some(index))
            .cloned()
            .collect()
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_chunk_state_changed(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }

    fn on_session_state_changed(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}

pub struct Harness {
    pub coordinator: UploadCoordinator,
    pub clients: Vec<Arc<ScriptedClient>>,
    pub recorder: Arc<RecordingReporter>,
    pub broadcast: BroadcastReporter,
}

impl Harness {
    pub async fn new(config: UploadConfig, servers: Vec<ScriptedClient>) -> Self {
        let registry = ServerRegistry::new();
        let accountant = CapacityAccountant::new_in_memory().await.unwrap();
        let mut clients = Vec::new();

        for server in servers {
            let client = Arc::new(server);
            let account_id = format!("acct-{}", client.id());
            registry
                .register(
                    ServerRegistration {
                        id: client.id().to_string(),
                        endpoint: client.endpoint(),
                        account_id: account_id.clone(),
                        region: None,
                    },
                    client.clone(),
                )
                .unwrap();
            accountant
                .upsert_account(&UsageRecord::new(account_id, ACCOUNT_QUOTA))
                .await
                .unwrap();
            clients.push(client);
        }

        let recorder = Arc::new(RecordingReporter::default());
        let broadcast = BroadcastReporter::new(1024);
        let reporter = FanoutReporter::new()
            .with(recorder.clone())
            .with(Arc::new(broadcast.clone()));

        let coordinator = UploadCoordinator::new(
            config,
            registry,
            PartialUploadLedger::new_in_memory().await.unwrap(),
            accountant,
            Arc::new(reporter),
        )
        .unwrap();

        Self {
            coordinator,
            clients,
            recorder,
            broadcast,
        }
    }

    pub fn client(&self, id: &str) -> &Arc<ScriptedClient> {
        self.clients.iter().find(|c| c.id() == id).unwrap()
    }

    /// Rebuild the file from the servers the outcome points at.
    pub fn reassemble(&self, outcome: &UploadOutcome) -> Vec<u8> {
        let mut data = Vec::new();
        for placement in outcome.placements() {
            let bytes = self
                .client(&placement.server_id)
                .fetch(&placement.locator)
                .unwrap();
            data.extend_from_slice(&bytes);
        }
        data
    }
}

/// Small chunks and short timeouts so scenarios run quickly.
pub fn fast_config(chunk_size: usize) -> UploadConfig {
    UploadConfig {
        chunk_size,
        max_in_flight: 4,
        retry_backoff_step: Duration::from_millis(2),
        selection_timeout: Duration::from_millis(300),
        selection_poll_interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        ..UploadConfig::default()
    }
}

pub fn random_data(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    data
}
