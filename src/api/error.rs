use crate::coordinator::CoordinatorError;
use crate::ledger::LedgerError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Coordinator error: {0}")]
    CoordinatorError(#[from] CoordinatorError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::CoordinatorError(e) => match e {
                CoordinatorError::SessionNotFound(_) | CoordinatorError::PartialUploadNotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                CoordinatorError::AlreadyInProgress(_) => (StatusCode::CONFLICT, "UPLOAD_IN_PROGRESS"),
                CoordinatorError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
                CoordinatorError::InvalidRequest(_) | CoordinatorError::IntegrityError(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
                }
                CoordinatorError::LedgerError(LedgerError::SizeMismatch { .. }) => {
                    (StatusCode::CONFLICT, "SIZE_MISMATCH")
                }
                CoordinatorError::LedgerError(LedgerError::InvalidChecksum(_)) => {
                    (StatusCode::BAD_REQUEST, "INVALID_CHECKSUM")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "COORDINATOR_ERROR"),
            },
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let message = match self {
            ApiError::CoordinatorError(e) => e.to_string(),
            ApiError::InvalidRequest(e) | ApiError::NotFound(e) | ApiError::InternalError(e) => e,
        };

        let body = Json(json!({
            "error": message,
            "code": error_code,
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let not_found = ApiError::from(CoordinatorError::SessionNotFound("x".into()));
        assert_eq!(not_found.status_and_code().0, StatusCode::NOT_FOUND);

        let busy = ApiError::from(CoordinatorError::AlreadyInProgress("x".into()));
        assert_eq!(busy.status_and_code(), (StatusCode::CONFLICT, "UPLOAD_IN_PROGRESS"));

        let closing = ApiError::from(CoordinatorError::ShuttingDown);
        assert_eq!(
            closing.status_and_code(),
            (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN")
        );

        let mismatch = ApiError::from(CoordinatorError::LedgerError(LedgerError::SizeMismatch {
            checksum: "ab".into(),
            recorded: 1,
            actual: 2,
        }));
        assert_eq!(mismatch.status_and_code(), (StatusCode::CONFLICT, "SIZE_MISMATCH"));

        let db = ApiError::from(CoordinatorError::LedgerError(LedgerError::DatabaseError(
            "locked".into(),
        )));
        assert_eq!(db.status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
