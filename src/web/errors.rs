//! Web-facing error type.
//!
//! Tag filter rule violations reach the caller as 400/404 with a stable code;
//! everything else is an infrastructure failure answered with 500.

use crate::error::SyndicationError;
use crate::logging::log_error;
use crate::tagging::TagFilterError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {message}")]
    NotFound { code: &'static str, message: String },

    #[error("Invalid request: {message}")]
    BadRequest { code: &'static str, message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<TagFilterError> for ApiError {
    fn from(err: TagFilterError) -> Self {
        let message = err.to_string();
        match err {
            TagFilterError::NotFound(_) => Self::NotFound {
                code: err.code(),
                message,
            },
            _ => Self::BadRequest {
                code: err.code(),
                message,
            },
        }
    }
}

impl From<SyndicationError> for ApiError {
    fn from(err: SyndicationError) -> Self {
        match err {
            SyndicationError::TagFilter(tag_err) => tag_err.into(),
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, code, message) = match self {
            ApiError::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            ApiError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            ApiError::Internal { message } => {
                log_error("web", "request", &message, None);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };

        let body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });
        (status_code, Json(body)).into_response()
    }
}
