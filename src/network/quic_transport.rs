use crate::network::client::{ChunkStoreHandler, StorageClient};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::types::{
    ChunkUploadHeader, ConnectionConfig, NetworkStats, ServerStatus, StoredChunk, WireRequest,
    WireResponse,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use quinn::{Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Requests are framed as `u32 header length | bincode header | body`.
const MAX_HEADER_SIZE: u32 = 64 * 1024;
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_SERVER_NAME: &str = "localhost";

/// Install the ring crypto provider for rustls; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// QUIC endpoint that can both issue storage requests and serve them.
pub struct QuicTransport {
    endpoint: Endpoint,
    connections: Arc<DashMap<SocketAddr, Connection>>,
    stats: Arc<RwLock<NetworkStats>>,
    max_body_size: usize,
}

impl QuicTransport {
    /// Create new QUIC transport with self-signed certificate
    pub async fn new(config: ConnectionConfig) -> NetworkResult<Self> {
        install_crypto_provider();

        if config.insecure_skip_verify {
            tracing::warn!(
                "TLS certificate verification is DISABLED; only use this against \
                 development storage nodes with self-signed certificates"
            );
        }

        let mut endpoint = Self::make_server_endpoint(&config)?;
        endpoint.set_default_client_config(Self::make_client_config(&config)?);

        Ok(Self {
            endpoint,
            connections: Arc::new(DashMap::new()),
            stats: Arc::new(RwLock::new(NetworkStats::default())),
            max_body_size: config.max_body_size,
        })
    }

    fn transport_config(config: &ConnectionConfig) -> NetworkResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(config.max_idle_timeout)
            .map_err(|e| NetworkError::QuicError(e.to_string()))?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config
            .max_concurrent_bidi_streams(config.max_concurrent_streams.into())
            .max_idle_timeout(Some(idle))
            .keep_alive_interval(Some(config.keep_alive_interval));
        Ok(transport_config)
    }

    /// Create server endpoint with self-signed certificate
    fn make_server_endpoint(config: &ConnectionConfig) -> NetworkResult<Endpoint> {
        let cert = rcgen::generate_simple_self_signed(vec![DEFAULT_SERVER_NAME.into()])
            .map_err(|e| NetworkError::CertificateError(e.to_string()))?;
        let cert_der = cert.cert.der().clone();
        let priv_key = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|e| NetworkError::CertificateError(e.to_string()))?;

        let mut server_config = ServerConfig::with_single_cert(vec![cert_der], priv_key)
            .map_err(|e| NetworkError::CertificateError(e.to_string()))?;
        server_config.transport_config(Arc::new(Self::transport_config(config)?));

        Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))
    }

    /// Client side; `insecure_skip_verify` accepts any certificate, otherwise
    /// system roots are used with webpki roots as a fallback.
    fn make_client_config(config: &ConnectionConfig) -> NetworkResult<quinn::ClientConfig> {
        let crypto = if config.insecure_skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut root_store = rustls::RootCertStore::empty();

            match rustls_native_certs::load_native_certs() {
                Ok(certs) => {
                    for cert in certs {
                        if let Err(e) = root_store.add(cert) {
                            tracing::warn!("Failed to add certificate to root store: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load native certificates: {}. Using webpki roots.",
                        e
                    );
                }
            }

            if root_store.is_empty() {
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }

            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| NetworkError::CertificateError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(Self::transport_config(config)?));
        Ok(client_config)
    }

    /// Connect to a storage server, reusing a live cached connection.
    pub async fn connect(
        &self,
        remote_addr: SocketAddr,
        server_name: &str,
    ) -> NetworkResult<Connection> {
        if let Some(conn) = self.connections.get(&remote_addr) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }
        self.connections.remove(&remote_addr);

        let conn = self
            .endpoint
            .connect(remote_addr, server_name)
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?
            .await?;

        self.connections.insert(remote_addr, conn.clone());
        self.stats.write().active_connections = self.connections.len();

        Ok(conn)
    }

    /// Accept incoming connection
    pub async fn accept(&self) -> NetworkResult<Connection> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| NetworkError::ConnectionClosed("Endpoint closed".into()))?;

        let conn = incoming.await?;

        self.connections.insert(conn.remote_address(), conn.clone());
        self.stats.write().active_connections = self.connections.len();

        Ok(conn)
    }

    /// Send one request and wait for its response.
    pub async fn request(
        &self,
        remote_addr: SocketAddr,
        server_name: &str,
        request: &WireRequest,
        body: &[u8],
    ) -> NetworkResult<WireResponse> {
        let conn = self.connect(remote_addr, server_name).await?;
        let result = self.request_on(&conn, request, body).await;
        if result.is_err() && conn.close_reason().is_some() {
            self.connections.remove(&remote_addr);
        }
        result
    }

    async fn request_on(
        &self,
        conn: &Connection,
        request: &WireRequest,
        body: &[u8],
    ) -> NetworkResult<WireResponse> {
        let (mut send_stream, mut recv_stream) = conn.open_bi().await?;

        let header = bincode::serialize(request)?;
        send_stream
            .write_u32(header.len() as u32)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        send_stream.write_all(&header).await?;
        send_stream.write_all(body).await?;
        send_stream
            .finish()
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        let raw = recv_stream.read_to_end(MAX_RESPONSE_SIZE).await?;
        let response = bincode::deserialize(&raw)?;

        {
            let mut stats = self.stats.write();
            stats.total_bytes_sent += (4 + header.len() + body.len()) as u64;
            stats.total_bytes_received += raw.len() as u64;
            stats.requests_sent += 1;
        }

        Ok(response)
    }

    /// Accept connections forever, answering requests with `handler`.
    pub async fn serve(self: Arc<Self>, handler: Arc<dyn ChunkStoreHandler>) -> NetworkResult<()> {
        loop {
            let conn = self.accept().await?;
            tracing::debug!(remote = %conn.remote_address(), "storage connection accepted");

            let transport = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.serve_connection(conn, handler).await {
                    tracing::warn!(error = %e, "storage connection ended with error");
                }
            });
        }
    }

    /// Answer every request stream opened on `conn` until it closes.
    pub async fn serve_connection(
        &self,
        conn: Connection,
        handler: Arc<dyn ChunkStoreHandler>,
    ) -> NetworkResult<()> {
        loop {
            let (send_stream, recv_stream) = match conn.accept_bi().await {
                Ok(streams) => streams,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let handler = handler.clone();
            let stats = self.stats.clone();
            let max_body_size = self.max_body_size;
            tokio::spawn(async move {
                if let Err(e) =
                    handle_stream(send_stream, recv_stream, handler, stats, max_body_size).await
                {
                    tracing::warn!(error = %e, "failed to answer storage request");
                }
            });
        }
    }

    /// Get local address
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        self.endpoint.local_addr().map_err(NetworkError::IoError)
    }

    /// Get network statistics
    pub fn stats(&self) -> NetworkStats {
        self.stats.read().clone()
    }

    /// Close all connections
    pub fn close(&self) {
        for entry in self.connections.iter() {
            entry.value().close(0u32.into(), b"closing");
        }
        self.connections.clear();
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handle_stream(
    mut send_stream: SendStream,
    mut recv_stream: RecvStream,
    handler: Arc<dyn ChunkStoreHandler>,
    stats: Arc<RwLock<NetworkStats>>,
    max_body_size: usize,
) -> NetworkResult<()> {
    let header_len = recv_stream
        .read_u32()
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
    if header_len > MAX_HEADER_SIZE {
        return Err(NetworkError::ReceiveFailed(format!(
            "request header of {header_len} bytes exceeds {MAX_HEADER_SIZE}"
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    recv_stream
        .read_exact(&mut header)
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
    let request: WireRequest = bincode::deserialize(&header)?;
    let body = recv_stream.read_to_end(max_body_size).await?;
    let received = 4 + header.len() + body.len();

    let response = match request {
        WireRequest::Status => WireResponse::Status(handler.status().await),
        WireRequest::UploadChunk(chunk_header) => {
            match handler.store_chunk(chunk_header, Bytes::from(body)).await {
                Ok(stored) => WireResponse::Stored(stored),
                Err(message) => WireResponse::Error { message },
            }
        }
    };

    let encoded = bincode::serialize(&response)?;
    send_stream.write_all(&encoded).await?;
    send_stream
        .finish()
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

    let mut stats = stats.write();
    stats.total_bytes_received += received as u64;
    stats.total_bytes_sent += encoded.len() as u64;
    stats.requests_served += 1;

    Ok(())
}

/// [`StorageClient`] for a storage node reachable over QUIC.
pub struct QuicStorageClient {
    server_id: String,
    addr: SocketAddr,
    server_name: String,
    transport: Arc<QuicTransport>,
}

impl QuicStorageClient {
    pub fn new(server_id: impl Into<String>, addr: SocketAddr, transport: Arc<QuicTransport>) -> Self {
        Self {
            server_id: server_id.into(),
            addr,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            transport,
        }
    }

    /// TLS server name to verify against.
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }
}

#[async_trait]
impl StorageClient for QuicStorageClient {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    async fn upload_chunk(
        &self,
        header: ChunkUploadHeader,
        data: Bytes,
    ) -> NetworkResult<StoredChunk> {
        let request = WireRequest::UploadChunk(header);
        match self
            .transport
            .request(self.addr, &self.server_name, &request, &data)
            .await?
        {
            WireResponse::Stored(stored) => Ok(stored),
            WireResponse::Error { message } => Err(NetworkError::Rejected(message)),
            other => Err(NetworkError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn server_status(&self) -> NetworkResult<ServerStatus> {
        match self
            .transport
            .request(self.addr, &self.server_name, &WireRequest::Status, &[])
            .await?
        {
            WireResponse::Status(status) => Ok(status),
            WireResponse::Error { message } => Err(NetworkError::Rejected(message)),
            other => Err(NetworkError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

// Certificate verifier that accepts any certificate (INSECURE - for testing only)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
