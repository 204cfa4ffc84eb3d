use std::sync::Arc;

use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use qwen_gateway_core::current_unix_timestamp_ms;

use crate::state::GatewayState;

pub(crate) async fn handle_health(State(state): State<Arc<GatewayState>>) -> Response {
    let uptime_seconds = current_unix_timestamp_ms().saturating_sub(state.started_at_ms) / 1_000;
    let (sessions_status, session_count) = match state.store.count_sessions() {
        Ok(count) => ("ok", Some(count)),
        Err(_) => ("error", None),
    };
    let usage = state.store.usage_stats(None).unwrap_or_default();
    let status = if sessions_status == "ok" { "ok" } else { "degraded" };

    let body = json!({
        "status": status,
        "uptime_seconds": uptime_seconds,
        "checks": {
            "auth": {
                "status": "ok",
                "token_preview": state.credentials.token_preview(),
                "cookie_preview": state.credentials.cookie_preview(),
            },
            "sessions": {
                "status": sessions_status,
                "count": session_count,
            },
        },
        "metrics": {
            "responses_recorded": usage.response_count,
            "total_tokens": usage.total_tokens,
            "errors_recorded": usage.error_count,
        },
    });
    let code = if status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

/// Prometheus exposition text. Empty when no recorder was installed (tests
/// run without one).
pub(crate) async fn handle_metrics(State(state): State<Arc<GatewayState>>) -> Response {
    let rendered = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        rendered,
    )
        .into_response()
}
