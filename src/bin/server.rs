use anyhow::{Context, Result};
use clap::Parser;
use shardstream::accounting::CapacityAccountant;
use shardstream::api::{create_api_server, ApiState};
use shardstream::config::ServerConfig;
use shardstream::coordinator::UploadCoordinator;
use shardstream::ledger::PartialUploadLedger;
use shardstream::network::{ConnectionConfig, QuicStorageClient, QuicTransport};
use shardstream::progress::{BroadcastReporter, FanoutReporter, TracingReporter};
use shardstream::registry::{ServerRegistration, ServerRegistry};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::parse();
    let upload_config = config
        .upload_config()
        .context("failed to load upload configuration")?;

    tracing::info!(
        listen = %config.listen,
        chunk_size = upload_config.chunk_size,
        max_in_flight = upload_config.max_in_flight,
        "starting shardstream server"
    );

    shardstream::metrics::install_recorder().context("failed to install metrics recorder")?;

    if let Some(parent) = sqlite_parent_dir(&config.database_url) {
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let pool = shardstream::db::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    let ledger = PartialUploadLedger::with_pool(pool.clone())
        .await
        .context("failed to initialise partial upload ledger")?;
    let accountant = CapacityAccountant::with_pool(pool)
        .await
        .context("failed to initialise capacity accountant")?;

    if let Some(path) = &config.accounts_file {
        let records = CapacityAccountant::load_records(path)
            .with_context(|| format!("failed to read accounts from {}", path.display()))?;
        for record in &records {
            accountant.upsert_account(record).await?;
        }
        tracing::info!(accounts = records.len(), "storage accounts loaded");
    }

    let transport = Arc::new(
        QuicTransport::new(ConnectionConfig {
            insecure_skip_verify: config.insecure,
            ..Default::default()
        })
        .await
        .context("failed to create QUIC transport")?,
    );

    let registry = ServerRegistry::new().with_refresh_timeout(config.status_timeout());
    let registrations = ServerRegistry::load_registrations(&config.servers_file)
        .with_context(|| format!("failed to read servers from {}", config.servers_file.display()))?;
    for registration in registrations {
        register_server(&registry, registration, transport.clone()).await?;
    }
    let reachable = registry.refresh().await;
    tracing::info!(servers = registry.len(), reachable, "storage servers registered");

    let events = BroadcastReporter::new(EVENT_BUFFER);
    let reporter = FanoutReporter::new()
        .with(Arc::new(events.clone()))
        .with(Arc::new(TracingReporter));

    let coordinator = UploadCoordinator::new(
        upload_config,
        registry,
        ledger,
        accountant,
        Arc::new(reporter),
    )?;

    let app = create_api_server(ApiState {
        coordinator: coordinator.clone(),
        events,
        spool_dir: config.spool_dir.clone(),
        max_upload_bytes: config.max_upload_bytes,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested, cancelling uploads");
            // Progress stays queryable while in-flight chunks settle.
            coordinator.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}

async fn register_server(
    registry: &ServerRegistry,
    registration: ServerRegistration,
    transport: Arc<QuicTransport>,
) -> Result<()> {
    let addr = tokio::net::lookup_host(&registration.endpoint)
        .await
        .with_context(|| format!("failed to resolve {}", registration.endpoint))?
        .next()
        .with_context(|| format!("no address for {}", registration.endpoint))?;

    let host = registration
        .endpoint
        .rsplit_once(':')
        .map(|(host, _)| host.trim_matches(|c| c == '[' || c == ']'))
        .unwrap_or(&registration.endpoint)
        .to_string();

    let client = QuicStorageClient::new(registration.id.clone(), addr, transport).with_server_name(host);
    registry.register(registration, Arc::new(client))?;
    Ok(())
}

/// Directory holding a file-backed SQLite database, if any.
fn sqlite_parent_dir(url: &str) -> Option<std::path::PathBuf> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    std::path::Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
}
