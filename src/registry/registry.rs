use super::error::{RegistryError, RegistryResult};
use super::scorer;
use super::types::{SelectionConstraints, ServerDescriptor, ServerRegistration};
use crate::network::{ServerCapabilities, ServerStatus, StorageClient};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Weight of the newest observation in the rolling averages.
const EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
struct Observed {
    active: bool,
    reported_load: u32,
    max_load: u32,
    capabilities: ServerCapabilities,
    response_time_ms: f64,
    success_rate: f64,
    last_refreshed: Option<chrono::DateTime<Utc>>,
}

struct ServerEntry {
    registration: ServerRegistration,
    client: Arc<dyn StorageClient>,
    /// Dispatches this process currently has outstanding on the server.
    in_flight: AtomicU32,
    observed: RwLock<Observed>,
}

impl ServerEntry {
    fn effective_load(&self, observed: &Observed) -> u32 {
        observed
            .reported_load
            .max(self.in_flight.load(Ordering::Acquire))
    }

    fn descriptor(&self) -> ServerDescriptor {
        let observed = self.observed.read();
        ServerDescriptor {
            id: self.registration.id.clone(),
            endpoint: self.registration.endpoint.clone(),
            account_id: self.registration.account_id.clone(),
            region: self.registration.region.clone(),
            active: observed.active,
            current_load: self.effective_load(&observed),
            max_load: observed.max_load,
            capabilities: observed.capabilities.clone(),
            response_time_ms: observed.response_time_ms.round() as u64,
            success_rate: observed.success_rate as f32,
            last_refreshed: observed.last_refreshed,
        }
    }

    /// Claim one load slot unless the server is already at its max load.
    fn try_claim(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            let (reported, max_load) = {
                let observed = self.observed.read();
                (observed.reported_load, observed.max_load)
            };
            if current.max(reported) >= max_load {
                return false;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn apply_status(&self, status: ServerStatus) {
        let mut observed = self.observed.write();
        observed.active = status.active;
        observed.reported_load = status.current_load;
        observed.max_load = status.max_load;
        observed.capabilities = status.capabilities;
        if observed.last_refreshed.is_none() {
            // First contact seeds the rolling averages.
            observed.response_time_ms = status.response_time_ms as f64;
            observed.success_rate = status.success_rate as f64;
        }
        observed.last_refreshed = Some(Utc::now());
    }
}

/// A claimed load slot on one server; released when dropped.
pub struct LoadGuard {
    entry: Arc<ServerEntry>,
    descriptor: ServerDescriptor,
}

impl LoadGuard {
    pub fn server_id(&self) -> &str {
        &self.entry.registration.id
    }

    pub fn account_id(&self) -> &str {
        &self.entry.registration.account_id
    }

    pub fn client(&self) -> Arc<dyn StorageClient> {
        self.entry.client.clone()
    }

    /// Snapshot taken at selection time.
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// How long a status refresh waits for one server before marking it inactive.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(2);

/// Known storage servers and their best known status.
#[derive(Clone)]
pub struct ServerRegistry {
    servers: Arc<DashMap<String, Arc<ServerEntry>>>,
    refresh_timeout: Duration,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            servers: Arc::new(DashMap::new()),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Read a JSON array of [`ServerRegistration`]s.
    pub fn load_registrations(path: &Path) -> RegistryResult<Vec<ServerRegistration>> {
        let raw = std::fs::read_to_string(path)?;
        let registrations: Vec<ServerRegistration> = serde_json::from_str(&raw)?;
        Ok(registrations)
    }

    /// Add a server. It stays inactive until the first successful refresh.
    pub fn register(
        &self,
        registration: ServerRegistration,
        client: Arc<dyn StorageClient>,
    ) -> RegistryResult<()> {
        if registration.id.is_empty() {
            return Err(RegistryError::InvalidServerList("empty server id".into()));
        }

        let id = registration.id.clone();
        let entry = Arc::new(ServerEntry {
            registration,
            client,
            in_flight: AtomicU32::new(0),
            observed: RwLock::new(Observed {
                active: false,
                reported_load: 0,
                max_load: 0,
                capabilities: ServerCapabilities {
                    max_chunk_size: 0,
                    free_space: 0,
                    supported_formats: Vec::new(),
                },
                response_time_ms: 0.0,
                success_rate: 1.0,
                last_refreshed: None,
            }),
        });

        match self.servers.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                Err(RegistryError::DuplicateServer(occupied.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Pull fresh status from every server. Unreachable servers are marked
    /// inactive. Returns how many servers answered.
    pub async fn refresh(&self) -> usize {
        let entries: Vec<Arc<ServerEntry>> =
            self.servers.iter().map(|e| e.value().clone()).collect();

        let timeout = self.refresh_timeout;
        let results = join_all(entries.into_iter().map(|entry| async move {
            let status = tokio::time::timeout(timeout, entry.client.server_status()).await;
            (entry, status)
        }))
        .await;

        let mut answered = 0;
        for (entry, status) in results {
            match status {
                Ok(Ok(status)) => {
                    entry.apply_status(status);
                    answered += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!(server_id = %entry.registration.id, error = %e, "server status refresh failed");
                    entry.observed.write().active = false;
                }
                Err(_) => {
                    tracing::warn!(server_id = %entry.registration.id, "server status refresh timed out");
                    entry.observed.write().active = false;
                }
            }
        }

        crate::metrics::recorder::set_active_servers(
            self.servers
                .iter()
                .filter(|e| e.value().observed.read().active)
                .count(),
        );
        answered
    }

    /// Pick the best eligible server and claim a load slot on it.
    ///
    /// `None` means no server currently qualifies; callers treat it as back
    /// pressure.
    pub fn select_server(
        &self,
        chunk_size: u64,
        constraints: &SelectionConstraints,
    ) -> Option<LoadGuard> {
        let snapshot = self.list();
        let ranked = scorer::rank(&snapshot, chunk_size, constraints);

        for (score, descriptor) in ranked {
            let Some(entry) = self.servers.get(&descriptor.id).map(|e| e.value().clone()) else {
                continue;
            };
            if entry.try_claim() {
                tracing::debug!(server_id = %descriptor.id, score, "server selected");
                return Some(LoadGuard {
                    entry,
                    descriptor: descriptor.clone(),
                });
            }
        }
        None
    }

    /// Fold one dispatch outcome into the rolling success rate and response
    /// time.
    pub fn record_outcome(&self, server_id: &str, success: bool, elapsed: Duration) {
        let Some(entry) = self.servers.get(server_id).map(|e| e.value().clone()) else {
            return;
        };
        let mut observed = entry.observed.write();
        let sample = if success { 1.0 } else { 0.0 };
        observed.success_rate = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * observed.success_rate;
        if success {
            let millis = elapsed.as_secs_f64() * 1000.0;
            observed.response_time_ms =
                EMA_ALPHA * millis + (1.0 - EMA_ALPHA) * observed.response_time_ms;
        }
    }

    pub fn get(&self, server_id: &str) -> Option<ServerDescriptor> {
        self.servers.get(server_id).map(|e| e.value().descriptor())
    }

    /// Snapshot of every server, sorted by id.
    pub fn list(&self) -> Vec<ServerDescriptor> {
        let mut servers: Vec<_> = self.servers.iter().map(|e| e.value().descriptor()).collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ChunkUploadHeader, NetworkError, NetworkResult, StoredChunk};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct StaticClient {
        id: String,
        status: Option<ServerStatus>,
        delay: Duration,
    }

    #[async_trait]
    impl StorageClient for StaticClient {
        fn server_id(&self) -> &str {
            &self.id
        }

        fn endpoint(&self) -> String {
            format!("{}.test:4433", self.id)
        }

        async fn upload_chunk(
            &self,
            _header: ChunkUploadHeader,
            _data: Bytes,
        ) -> NetworkResult<StoredChunk> {
            Ok(StoredChunk {
                locator: "x".into(),
            })
        }

        async fn server_status(&self) -> NetworkResult<ServerStatus> {
            tokio::time::sleep(self.delay).await;
            self.status
                .clone()
                .ok_or_else(|| NetworkError::ConnectionFailed("unreachable".into()))
        }
    }

    fn status(max_load: u32, success_rate: f32) -> ServerStatus {
        ServerStatus {
            active: true,
            current_load: 0,
            max_load,
            capabilities: ServerCapabilities {
                max_chunk_size: 1024 * 1024,
                free_space: 1024 * 1024 * 1024,
                supported_formats: vec!["*".into()],
            },
            response_time_ms: 20,
            success_rate,
        }
    }

    fn register(registry: &ServerRegistry, id: &str, status: Option<ServerStatus>) {
        registry
            .register(
                ServerRegistration {
                    id: id.into(),
                    endpoint: format!("{id}.test:4433"),
                    account_id: format!("acct-{id}"),
                    region: None,
                },
                Arc::new(StaticClient {
                    id: id.into(),
                    status,
                    delay: Duration::ZERO,
                }),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_unrefreshed_servers_are_not_selected() {
        let registry = ServerRegistry::new();
        register(&registry, "a", Some(status(4, 1.0)));

        assert!(registry.select_server(1024, &SelectionConstraints::default()).is_none());
        assert_eq!(registry.refresh().await, 1);
        assert!(registry.select_server(1024, &SelectionConstraints::default()).is_some());
    }

    #[tokio::test]
    async fn test_refresh_failure_marks_inactive() {
        let registry = ServerRegistry::new();
        register(&registry, "up", Some(status(4, 1.0)));
        register(&registry, "down", None);

        assert_eq!(registry.refresh().await, 1);
        assert!(registry.get("up").unwrap().active);
        assert!(!registry.get("down").unwrap().active);
    }

    #[tokio::test]
    async fn test_slow_server_bounded_by_refresh_timeout() {
        let registry = ServerRegistry::new().with_refresh_timeout(Duration::from_millis(50));
        register(&registry, "fast", Some(status(4, 1.0)));
        registry
            .register(
                ServerRegistration {
                    id: "slow".into(),
                    endpoint: "slow.test:4433".into(),
                    account_id: "acct-slow".into(),
                    region: None,
                },
                Arc::new(StaticClient {
                    id: "slow".into(),
                    status: Some(status(4, 1.0)),
                    delay: Duration::from_secs(30),
                }),
            )
            .unwrap();

        let started = std::time::Instant::now();
        assert_eq!(registry.refresh().await, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.get("fast").unwrap().active);
        assert!(!registry.get("slow").unwrap().active);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ServerRegistry::new();
        register(&registry, "a", None);
        let result = registry.register(
            ServerRegistration {
                id: "a".into(),
                endpoint: "elsewhere".into(),
                account_id: "acct".into(),
                region: None,
            },
            Arc::new(StaticClient {
                id: "a".into(),
                status: None,
                delay: Duration::ZERO,
            }),
        );
        assert!(matches!(result, Err(RegistryError::DuplicateServer(id)) if id == "a"));
    }

    #[tokio::test]
    async fn test_load_slots_are_bounded_and_released() {
        let registry = ServerRegistry::new();
        register(&registry, "a", Some(status(2, 1.0)));
        registry.refresh().await;

        let constraints = SelectionConstraints::default();
        let first = registry.select_server(1024, &constraints).unwrap();
        let second = registry.select_server(1024, &constraints).unwrap();
        assert!(registry.select_server(1024, &constraints).is_none());
        assert_eq!(registry.get("a").unwrap().current_load, 2);

        drop(first);
        assert_eq!(registry.get("a").unwrap().current_load, 1);
        assert!(registry.select_server(1024, &constraints).is_some());
        drop(second);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_exceed_max_load() {
        let registry = ServerRegistry::new();
        register(&registry, "a", Some(status(5, 1.0)));
        registry.refresh().await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.select_server(1, &SelectionConstraints::default())
            }));
        }

        let mut guards = Vec::new();
        for handle in handles {
            if let Some(guard) = handle.await.unwrap() {
                guards.push(guard);
            }
        }
        assert_eq!(guards.len(), 5);
        assert_eq!(registry.get("a").unwrap().current_load, 5);
    }

    #[tokio::test]
    async fn test_full_server_falls_through_to_next() {
        let registry = ServerRegistry::new();
        register(&registry, "best", Some(status(1, 1.0)));
        register(&registry, "other", Some(status(1, 0.5)));
        registry.refresh().await;

        let constraints = SelectionConstraints::default();
        let a = registry.select_server(1, &constraints).unwrap();
        assert_eq!(a.server_id(), "best");
        let b = registry.select_server(1, &constraints).unwrap();
        assert_eq!(b.server_id(), "other");
        assert_eq!(b.account_id(), "acct-other");
    }

    #[tokio::test]
    async fn test_record_outcome_moves_success_rate() {
        let registry = ServerRegistry::new();
        register(&registry, "a", Some(status(4, 1.0)));
        registry.refresh().await;

        registry.record_outcome("a", false, Duration::from_millis(5));
        let rate = registry.get("a").unwrap().success_rate;
        assert!((rate - 0.8).abs() < 1e-6);

        registry.record_outcome("a", true, Duration::from_millis(120));
        let descriptor = registry.get("a").unwrap();
        assert!((descriptor.success_rate - 0.84).abs() < 1e-6);
        // 0.2 * 120 + 0.8 * 20
        assert_eq!(descriptor.response_time_ms, 40);
    }

    #[test]
    fn test_load_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"[{"id": "s1", "endpoint": "127.0.0.1:4433", "account_id": "a1"},
                {"id": "s2", "endpoint": "127.0.0.1:4434", "account_id": "a2", "region": "eu"}]"#,
        )
        .unwrap();

        let registrations = ServerRegistry::load_registrations(&path).unwrap();
        assert_eq!(registrations.len(), 2);
        assert_eq!(registrations[1].region.as_deref(), Some("eu"));
    }
}
