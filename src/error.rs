//! HTTP-facing error type and its mapping to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or incomplete request body.
    #[error("{0}")]
    BadRequest(String),

    /// Alias did not resolve. Ollama clients key off the 404.
    #[error("{0}")]
    ModelNotFound(String),

    /// Any other backend failure; the message is passed through.
    #[error("{0}")]
    Backend(String),

    /// The shutdown grace period ran out while the request was in flight.
    #[error("Server shutting down")]
    ShuttingDown,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Collapse every backend error into a 500, including not-found.
    pub fn backend(err: BackendError) -> Self {
        ProxyError::Backend(err.to_string())
    }
}

impl From<BackendError> for ProxyError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ModelNotFound(_) => ProxyError::ModelNotFound(err.to_string()),
            other => ProxyError::Backend(other.to_string()),
        }
    }
}

/// JSON error body: `{"error": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        let not_found: ProxyError = BackendError::ModelNotFound("x".into()).into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let api: ProxyError = BackendError::Api("boom".into()).into();
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.to_string(), "backend error: boom");

        let show = ProxyError::backend(BackendError::ModelNotFound("x".into()));
        assert_eq!(show.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(ProxyError::ShuttingDown.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
