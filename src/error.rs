//! Error types for minicpm-adapter.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for minicpm-adapter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Backend could not be reached or timed out.
    #[error("llama-server error: {0}")]
    BackendUnavailable(String),

    /// Backend answered with a non-success status.
    #[error("llama-server error: status {status}: {body}")]
    BackendStatus { status: u16, body: String },

    #[error("{0}")]
    Session(String),

    #[error("Prefill failed: {0}")]
    Prefill(String),

    #[error("Generate failed: {0}")]
    Generate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request failed: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable tag for the error body's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "internal_error",
            Error::BadRequest(_) => "invalid_request",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::BackendStatus { .. } => "backend_error",
            Error::Session(_) => "session_error",
            Error::Prefill(_) => "prefill_failed",
            Error::Generate(_) => "generate_failed",
            Error::NotFound(_) => "not_found",
            Error::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BackendStatus { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Session(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Prefill(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Generate(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        // `detail` for FastAPI-style clients, `error` in the OpenAI shape
        let body = serde_json::json!({
            "detail": message,
            "error": {
                "message": message,
                "type": self.kind(),
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
