use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use qwen_gateway_store::StoreError;
use qwen_gateway_upstream::UpstreamError;

/// Client-facing error carrying the OpenAI error envelope. Every failure
/// path funnels through here so the wire shape stays uniform, including on
/// 5xx.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        error_type: &'static str,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            error_type,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_request",
            message,
        )
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "invalid_request_error", code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            "internal_error",
            message,
        )
    }

    /// Routes each tagged upstream failure onto its HTTP surface.
    pub fn from_upstream(error: &UpstreamError) -> Self {
        match error {
            UpstreamError::AuthChallenge => Self::new(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_api_key",
                "upstream rejected the gateway credentials",
            ),
            UpstreamError::InvalidParent(message) => Self::new(
                StatusCode::BAD_REQUEST,
                "api_error",
                "invalid_parent",
                message.clone(),
            ),
            UpstreamError::SemanticError(message) => Self::new(
                StatusCode::BAD_REQUEST,
                "api_error",
                "upstream_error",
                message.clone(),
            ),
            UpstreamError::UpstreamStatus { status: 429, .. } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "rate_limit_exceeded",
                "upstream rate limit reached",
            ),
            UpstreamError::UpstreamStatus { status, .. } if *status < 500 => Self::new(
                StatusCode::BAD_REQUEST,
                "api_error",
                "upstream_error",
                format!("upstream rejected the request with status {status}"),
            ),
            UpstreamError::Transient(_)
            | UpstreamError::Timeout(_)
            | UpstreamError::UpstreamStatus { .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                "api_error",
                "upstream_unavailable",
                "upstream is temporarily unavailable",
            ),
            UpstreamError::Serde(_) | UpstreamError::InvalidResponse(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                "api_error",
                "upstream_protocol_error",
                "upstream returned an unreadable reply",
            ),
        }
    }

    pub fn from_store(error: &StoreError) -> Self {
        tracing::error!(error = %error, "store failure reached the request path");
        Self::internal("gateway storage error")
    }

    /// The error envelope as a value, for SSE frames written after the 200
    /// header has already gone out.
    pub fn envelope(&self) -> Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.error_type,
                "code": self.code,
            }
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope())).into_response()
    }
}
