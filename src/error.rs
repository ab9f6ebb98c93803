//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`ProviderError`]: failures of the remote collaborators (speech recognition,
//!   chat completions, realtime synthesis). These travel through the pipeline and
//!   end up in a synthesis bridge's error slot or in an HTTP response.
//! - [`AppError`]: what an HTTP handler returns. It is converted to a JSON
//!   response through actix's `ResponseError` trait.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "upstream_error",
//!     "message": "provider returned 401: ...",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors surfaced by the HTTP layer.
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// A remote provider call failed before any response bytes were sent
    Upstream(String),

    /// Too many concurrent voice sessions
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::Upstream(msg) => ("upstream_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Provider failures are only visible to HTTP clients when no audio has been
/// streamed yet, so they always map to a gateway error.
impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotConfigured(msg) => AppError::ConfigError(msg),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures of the remote speech and chat collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Request could not be sent or the body could not be read
    #[error("http error: {0}")]
    Http(String),

    /// Provider answered with a non-success status
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not have the expected shape
    #[error("bad provider response: {0}")]
    BadResponse(String),

    /// Recognition finished without usable text
    #[error("transcription returned no text")]
    EmptyTranscript,

    /// Realtime channel failed (connect, send, receive)
    #[error("transport error: {0}")]
    Transport(String),

    /// The synthesis session reported an error event
    #[error("synthesis session error: {0}")]
    Session(String),

    /// The synthesis session did not finish within its time budget
    #[error("synthesis session timed out after {0}s")]
    Timeout(u64),

    /// Credentials or endpoints are missing
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProviderError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Upstream("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            AppError::Unavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_provider_error_conversion() {
        let err: AppError = ProviderError::EmptyTranscript.into();
        assert!(matches!(err, AppError::Upstream(_)));

        let err: AppError = ProviderError::NotConfigured("missing api key".into()).into();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[actix_web::test]
    async fn test_error_response_body() {
        let response = AppError::Upstream("provider returned 500: boom".into()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "upstream_error");
        assert_eq!(value["error"]["message"], "provider returned 500: boom");
    }
}
