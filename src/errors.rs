use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures raised by the upload, registry and persistence services.
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("chunk index {index} outside 0..{count}")]
    IndexOutOfRange { index: i64, count: u32 },
    #[error("file size {size} exceeds the limit of {max} bytes")]
    SizeLimitExceeded { size: u64, max: u64 },
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("upload incomplete: {missing} chunk(s) not received")]
    IncompleteUpload { missing: usize },
    #[error("no free retrieval code available")]
    CodeSpaceExhausted,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type ShareResult<T> = Result<T, ShareError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        let status = match &err {
            ShareError::NotFound(_) => StatusCode::NOT_FOUND,
            ShareError::Forbidden(_) => StatusCode::FORBIDDEN,
            ShareError::IndexOutOfRange { .. } => StatusCode::NOT_FOUND,
            ShareError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ShareError::Malformed(_) => StatusCode::BAD_REQUEST,
            ShareError::IncompleteUpload { .. } => StatusCode::CONFLICT,
            ShareError::CodeSpaceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ShareError::Io(_) | ShareError::Json(_) | ShareError::Sqlx(_) => {
                tracing::error!(error = %err, "request failed");
                return AppError::internal("internal storage error");
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ShareError::NotFound("code".into()), StatusCode::NOT_FOUND),
            (ShareError::Forbidden("token".into()), StatusCode::FORBIDDEN),
            (
                ShareError::IndexOutOfRange { index: 9, count: 3 },
                StatusCode::NOT_FOUND,
            ),
            (
                ShareError::SizeLimitExceeded { size: 3, max: 2 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (ShareError::Malformed("x".into()), StatusCode::BAD_REQUEST),
            (
                ShareError::IncompleteUpload { missing: 1 },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn test_io_errors_are_not_leaked() {
        let err = ShareError::Io(io::Error::new(io::ErrorKind::Other, "/secret/path"));
        let app = AppError::from(err);
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!app.message.contains("/secret/path"));
    }
}
