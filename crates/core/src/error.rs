use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Cooldown applied when a saturated target gives no `retry-after-ms` hint,
/// and advertised to callers when every target is cooling down.
pub const DEFAULT_RETRY_AFTER_MS: u64 = 10_000;

/// Unified error type for all proxy operations.
///
/// Validation, authentication, and configuration failures render a JSON body
/// with an `error` field; capacity exhaustion renders a `message` field plus
/// a `retry-after-ms` header, matching what the upstream API emits for its
/// own throttling responses.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Could not find any endpoint or deployment with remaining capacity. Try again later.")]
    NoCapacity,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoCapacity => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match self {
            Self::NoCapacity => (
                status,
                [
                    ("content-type", "application/json".to_string()),
                    ("retry-after-ms", DEFAULT_RETRY_AFTER_MS.to_string()),
                ],
                json!({ "message": self.to_string() }).to_string(),
            )
                .into_response(),
            _ => (
                status,
                [("content-type", "application/json".to_string())],
                json!({ "error": self.to_string() }).to_string(),
            )
                .into_response(),
        }
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}
