//! Top-level HTTP error type. Maps each structured error kind onto a status
//! code and a `{detail}` JSON body — axum's `IntoResponse` is the pack's
//! standard seam for this (see `core-rs::caldav::error` for the equivalent
//! shape in the teacher repo).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

use relay_core::{AuthError, RelayError, StoreError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid API token")]
    InvalidApiToken,
    #[error("device not found")]
    DeviceNotFound,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("device limit exceeded: maximum {0}")]
    LimitExceeded(i64),
    #[error("too many envelopes queued for this target")]
    Backpressure,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::AuthRequired => ApiError::AuthRequired,
            AuthError::InvalidApiToken => ApiError::InvalidApiToken,
            AuthError::DeviceNotFound => ApiError::DeviceNotFound,
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::MissingField(_) => ApiError::DeviceNotFound,
            RelayError::UnsupportedVersion => ApiError::UnsupportedVersion,
            RelayError::DeviceNotFound => ApiError::DeviceNotFound,
            RelayError::Backpressure => ApiError::Backpressure,
            RelayError::Store(e) => ApiError::Store(e),
        }
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::AuthRequired => (StatusCode::UNAUTHORIZED, "AUTH_REQUIRED"),
            ApiError::InvalidApiToken => (StatusCode::UNAUTHORIZED, "INVALID_API_TOKEN"),
            ApiError::DeviceNotFound => (StatusCode::NOT_FOUND, "DEVICE_NOT_FOUND"),
            ApiError::UnsupportedVersion => (StatusCode::BAD_REQUEST, "UNSUPPORTED_VERSION"),
            ApiError::LimitExceeded(_) => (StatusCode::FORBIDDEN, "LIMIT_EXCEEDED"),
            ApiError::Backpressure => (StatusCode::SERVICE_UNAVAILABLE, "BACKPRESSURE"),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if matches!(self, ApiError::Store(_)) {
            tracing::error!(error = %self, "unhandled store error");
            return (
                status,
                Json(json!({ "detail": "internal server error" })),
            )
                .into_response();
        }
        (status, Json(json!({ "detail": self.to_string(), "error": kind }))).into_response()
    }
}
