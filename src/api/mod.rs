mod error;
mod rest;
mod types;
mod websocket;

pub use error::{ApiError, ApiResult};
pub use rest::RestApi;
pub use types::*;
pub use websocket::websocket_handler;

use crate::coordinator::UploadCoordinator;
use crate::metrics::metrics_route;
use crate::progress::BroadcastReporter;
use axum::{routing::get, Router};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
pub struct ApiState {
    pub coordinator: UploadCoordinator,
    /// Same reporter the coordinator emits into; feeds `/ws`.
    pub events: BroadcastReporter,
    /// Where multipart bodies are buffered before chunking.
    pub spool_dir: PathBuf,
    /// Cap on upload request bodies; `None` lifts axum's 2 MB default.
    pub max_upload_bytes: Option<usize>,
}

/// Create a complete API server with REST, WebSocket and metrics routes
pub fn create_api_server(state: ApiState) -> Router {
    let state = Arc::new(state);
    let rest_api = RestApi::new(state.clone());

    // Configure CORS to allow frontend requests
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_router = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state);

    Router::new()
        .merge(rest_api.router())
        .merge(ws_router)
        .route("/metrics", metrics_route())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
