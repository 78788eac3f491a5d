use crate::api::error::{ApiError, ApiResult};
use crate::api::types::*;
use crate::api::ApiState;
use crate::coordinator::{SessionProgress, UploadRequest};
use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

pub struct RestApi {
    state: Arc<ApiState>,
}

impl RestApi {
    pub fn new(state: Arc<ApiState>) -> Self {
        Self { state }
    }

    fn upload_body_limit(&self) -> DefaultBodyLimit {
        match self.state.max_upload_bytes {
            Some(limit) => DefaultBodyLimit::max(limit),
            None => DefaultBodyLimit::disable(),
        }
    }

    pub fn router(&self) -> Router {
        let body_limit = self.upload_body_limit();

        Router::new()
            .route("/health", get(health_check))
            .route(
                "/api/v1/uploads",
                post(start_upload).layer(body_limit).get(list_uploads),
            )
            .route(
                "/api/v1/uploads/resume",
                post(resume_upload).layer(body_limit),
            )
            .route("/api/v1/uploads/:id", get(get_upload))
            .route("/api/v1/uploads/:id/cancel", post(cancel_upload))
            .route("/api/v1/servers", get(list_servers))
            .route("/api/v1/partial-uploads", get(list_partial_uploads))
            .route(
                "/api/v1/partial-uploads/:checksum",
                delete(delete_partial_upload),
            )
            .route(
                "/api/v1/partial-uploads/:checksum/resumable",
                get(check_resumable),
            )
            .with_state(self.state.clone())
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// Request body written to an anonymous file in the spool directory.
struct SpooledFile {
    file: File,
    file_name: String,
    content_type: Option<String>,
    size: u64,
}

#[derive(Default)]
struct UploadForm {
    file: Option<SpooledFile>,
    mime_type: Option<String>,
    owner: Option<String>,
    checksum: Option<String>,
}

async fn read_form(state: &ApiState, mut multipart: Multipart) -> ApiResult<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("Failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => form.file = Some(spool_field(state, field).await?),
            "mime_type" => form.mime_type = Some(text_field(field).await?),
            "owner" => form.owner = Some(text_field(field).await?),
            "checksum" => form.checksum = Some(text_field(field).await?),
            _ => {}
        }
    }

    Ok(form)
}

async fn text_field(field: Field<'_>) -> ApiResult<String> {
    let name = field.name().unwrap_or("").to_string();
    let value = field
        .text()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("Failed to read {name}: {e}")))?;
    Ok(value.trim().to_string())
}

async fn spool_field(state: &ApiState, mut field: Field<'_>) -> ApiResult<SpooledFile> {
    let file_name = field
        .file_name()
        .ok_or_else(|| ApiError::InvalidRequest("No filename provided".to_string()))?
        .to_string();
    let content_type = field.content_type().map(str::to_string);

    tokio::fs::create_dir_all(&state.spool_dir)
        .await
        .map_err(|e| ApiError::InternalError(format!("Failed to create spool directory: {e}")))?;

    // Unlinked on creation; the space is reclaimed once the session drops it.
    let spool = tempfile::tempfile_in(&state.spool_dir)
        .map_err(|e| ApiError::InternalError(format!("Failed to create spool file: {e}")))?;
    let mut file = File::from_std(spool);

    let mut size = 0u64;
    while let Some(bytes) = field
        .chunk()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("Failed to read file data: {e}")))?
    {
        file.write_all(&bytes)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to write spool file: {e}")))?;
        size += bytes.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| ApiError::InternalError(format!("Failed to write spool file: {e}")))?;

    Ok(SpooledFile {
        file,
        file_name,
        content_type,
        size,
    })
}

async fn start_upload(
    State(state): State<Arc<ApiState>>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<StartUploadResponse>)> {
    let form = read_form(&state, multipart).await?;
    let spooled = form
        .file
        .ok_or_else(|| ApiError::InvalidRequest("No file uploaded".to_string()))?;

    let mime_type = form
        .mime_type
        .filter(|m| !m.is_empty())
        .or(spooled.content_type)
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

    let mut request = UploadRequest::new(spooled.file_name, mime_type, spooled.size);
    request.owner = form.owner.filter(|o| !o.is_empty());

    let handle = state.coordinator.start_upload(spooled.file, request)?;
    let session_id = handle.session_id().to_string();

    Ok((
        StatusCode::CREATED,
        Json(StartUploadResponse {
            session_id: session_id.clone(),
            message: format!("Upload started with session ID: {session_id}"),
        }),
    ))
}

async fn resume_upload(
    State(state): State<Arc<ApiState>>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<StartUploadResponse>)> {
    let form = read_form(&state, multipart).await?;
    let checksum = form
        .checksum
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("No checksum provided".to_string()))?;
    let spooled = form
        .file
        .ok_or_else(|| ApiError::InvalidRequest("No file uploaded".to_string()))?;

    let handle = state
        .coordinator
        .resume_upload(&checksum, spooled.file, form.owner.filter(|o| !o.is_empty()))
        .await?;
    let session_id = handle.session_id().to_string();

    Ok((
        StatusCode::CREATED,
        Json(StartUploadResponse {
            session_id: session_id.clone(),
            message: format!("Resuming {checksum} with session ID: {session_id}"),
        }),
    ))
}

async fn list_uploads(State(state): State<Arc<ApiState>>) -> Json<ListUploadsResponse> {
    let uploads = state.coordinator.list_active();
    let count = uploads.len();
    Json(ListUploadsResponse { uploads, count })
}

async fn get_upload(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionProgress>> {
    Ok(Json(state.coordinator.progress(&session_id)?))
}

async fn cancel_upload(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SuccessResponse>> {
    state.coordinator.cancel_upload(&session_id)?;
    Ok(Json(SuccessResponse {
        message: format!("Upload {session_id} cancelled"),
    }))
}

async fn list_servers(State(state): State<Arc<ApiState>>) -> Json<ListServersResponse> {
    let servers = state.coordinator.list_available_servers().await;
    let count = servers.len();
    Json(ListServersResponse { servers, count })
}

async fn list_partial_uploads(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<ListPartialUploadsResponse>> {
    let entries = state
        .coordinator
        .list_partial_uploads(query.owner.as_deref())
        .await?;
    let partial_uploads: Vec<PartialUploadSummary> =
        entries.iter().map(PartialUploadSummary::from).collect();
    let count = partial_uploads.len();
    Ok(Json(ListPartialUploadsResponse {
        partial_uploads,
        count,
    }))
}

async fn check_resumable(
    State(state): State<Arc<ApiState>>,
    Path(checksum): Path<String>,
    Query(query): Query<SizeQuery>,
) -> ApiResult<Json<ResumableResponse>> {
    let entry = state
        .coordinator
        .check_resumable(&checksum, query.size)
        .await?;

    let response = match entry {
        Some(entry) => ResumableResponse {
            resumable: true,
            completed_chunks: entry.completed_indices().into_iter().collect(),
            total_chunks: Some(entry.total_chunks),
            checksum: entry.checksum,
        },
        None => ResumableResponse {
            resumable: false,
            checksum,
            completed_chunks: Vec::new(),
            total_chunks: None,
        },
    };
    Ok(Json(response))
}

async fn delete_partial_upload(
    State(state): State<Arc<ApiState>>,
    Path(checksum): Path<String>,
) -> ApiResult<Json<SuccessResponse>> {
    if !state.coordinator.delete_partial_upload(&checksum).await? {
        return Err(ApiError::NotFound(format!("Partial upload not found: {checksum}")));
    }
    Ok(Json(SuccessResponse {
        message: format!("Partial upload {checksum} deleted"),
    }))
}
