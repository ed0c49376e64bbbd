//! Unified error type for the HTTP surface. Maps internal errors to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::ingest::IngestError;
use crate::query::QueryError;
use crate::resource_limits::ResourceLimitError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Busy(#[from] ResourceLimitError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Busy(_) => StatusCode::CONFLICT,
            Self::Query(e) => match e {
                QueryError::InvalidThreshold(_)
                | QueryError::InvalidLimit
                | QueryError::InvalidImage
                | QueryError::NoFaceFound => StatusCode::BAD_REQUEST,
                QueryError::Extraction(_) | QueryError::Store(_) | QueryError::Audit(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Store(_) | Self::Ingest(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Client-facing message. Errors from a query keep their own wording.
    fn detail(&self) -> String {
        match self {
            Self::Query(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }
        let body = Json(serde_json::json!({ "detail": self.detail() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::from(QueryError::NoFaceFound).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(QueryError::InvalidLimit).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(ResourceLimitError::RunInProgress { max: 1 }).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(StoreError::Config("x".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::from(QueryError::Store(StoreError::Config("x".into()))).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_no_face_message() {
        let err = AppError::from(QueryError::NoFaceFound);
        assert_eq!(err.detail(), "No face detected in the selfie");
    }
}
