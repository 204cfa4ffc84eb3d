use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::{json, Value};

use qwen_gateway_core::current_unix_timestamp_ms;
use qwen_gateway_store::{RequestFilter, RequestRow, ResponseRow};

use crate::endpoints::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::error::ApiError;
use crate::state::GatewayState;

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PageQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
    }

    fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RequestsQuery {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ResponsesQuery {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

/// Date filters accept epoch milliseconds or an RFC 3339 timestamp.
fn parse_date_param(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ms) = trimmed.parse::<u64>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .and_then(|parsed| u64::try_from(parsed.timestamp_millis()).ok())
}

/// Audit rows carry their body blobs parsed, not re-stringified.
fn parse_blob(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn request_payload(row: &RequestRow) -> Value {
    json!({
        "id": row.id,
        "session_id": row.session_id,
        "timestamp": row.timestamp,
        "model": row.model,
        "stream": row.stream,
        "inbound_body": parse_blob(&row.inbound_body),
        "upstream_body": parse_blob(&row.upstream_body),
    })
}

fn response_payload(row: &ResponseRow) -> Value {
    json!({
        "id": row.id,
        "session_id": row.session_id,
        "timestamp": row.timestamp,
        "upstream_body": row.upstream_body.as_deref().map(parse_blob),
        "outbound_body": parse_blob(&row.outbound_body),
        "parent_id": row.parent_id,
        "prompt_tokens": row.prompt_tokens,
        "completion_tokens": row.completion_tokens,
        "total_tokens": row.total_tokens,
        "finish_reason": row.finish_reason,
        "error_message": row.error_message,
        "duration_ms": row.duration_ms,
    })
}

fn list_payload(data: Vec<Value>, limit: usize, offset: usize) -> Value {
    json!({
        "object": "list",
        "data": data,
        "limit": limit,
        "offset": offset,
    })
}

pub(crate) async fn handle_list_sessions(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    let (limit, offset) = (query.limit(), query.offset());
    match state.store.list_sessions(limit, offset) {
        Ok(sessions) => {
            let data = sessions
                .iter()
                .filter_map(|session| serde_json::to_value(session).ok())
                .collect();
            Json(list_payload(data, limit, offset)).into_response()
        }
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_get_session(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    match state.store.get_session(&session_id, current_unix_timestamp_ms()) {
        Ok(Some(session)) => Json(serde_json::to_value(&session).unwrap_or_default()).into_response(),
        Ok(None) => session_not_found(&session_id).into_response(),
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_session_stats(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    match state.store.session_stats(&session_id, current_unix_timestamp_ms()) {
        Ok(Some(stats)) => Json(serde_json::to_value(&stats).unwrap_or_default()).into_response(),
        Ok(None) => session_not_found(&session_id).into_response(),
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_session_requests(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    let (limit, offset) = (query.limit(), query.offset());
    let filter = RequestFilter {
        session_id: Some(session_id),
        limit,
        offset,
        ..RequestFilter::default()
    };
    match state.store.list_requests(&filter) {
        Ok(rows) => {
            let data = rows.iter().map(request_payload).collect();
            Json(list_payload(data, limit, offset)).into_response()
        }
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_delete_session(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    match state.store.delete_session(&session_id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => session_not_found(&session_id).into_response(),
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_list_requests(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<RequestsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let filter = RequestFilter {
        session_id: query.session_id.clone(),
        model: query.model.clone(),
        start_ms: query.start_date.as_deref().and_then(parse_date_param),
        end_ms: query.end_date.as_deref().and_then(parse_date_param),
        limit,
        offset,
    };
    match state.store.list_requests(&filter) {
        Ok(rows) => {
            let data = rows.iter().map(request_payload).collect();
            Json(list_payload(data, limit, offset)).into_response()
        }
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_get_request(
    State(state): State<Arc<GatewayState>>,
    AxumPath(request_id): AxumPath<String>,
) -> Response {
    match state.store.get_request(&request_id) {
        Ok(Some(row)) => Json(request_payload(&row)).into_response(),
        Ok(None) => {
            ApiError::not_found("request_not_found", format!("request '{request_id}' is unknown"))
                .into_response()
        }
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_request_response(
    State(state): State<Arc<GatewayState>>,
    AxumPath(request_id): AxumPath<String>,
) -> Response {
    match state.store.response_for_request(&request_id) {
        Ok(Some(row)) => Json(response_payload(&row)).into_response(),
        Ok(None) => ApiError::not_found(
            "response_not_found",
            format!("request '{request_id}' has no recorded response"),
        )
        .into_response(),
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_list_responses(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ResponsesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    match state
        .store
        .list_responses(query.session_id.as_deref(), limit, offset)
    {
        Ok(rows) => {
            let data = rows.iter().map(response_payload).collect();
            Json(list_payload(data, limit, offset)).into_response()
        }
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_get_response(
    State(state): State<Arc<GatewayState>>,
    AxumPath(response_id): AxumPath<String>,
) -> Response {
    match state.store.get_response(&response_id) {
        Ok(Some(row)) => Json(response_payload(&row)).into_response(),
        Ok(None) => ApiError::not_found(
            "response_not_found",
            format!("response '{response_id}' is unknown"),
        )
        .into_response(),
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

pub(crate) async fn handle_responses_stats(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ResponsesQuery>,
) -> Response {
    match state.store.usage_stats(query.session_id.as_deref()) {
        Ok(stats) => Json(serde_json::to_value(&stats).unwrap_or_default()).into_response(),
        Err(error) => ApiError::from_store(&error).into_response(),
    }
}

fn session_not_found(session_id: &str) -> ApiError {
    ApiError::not_found("session_not_found", format!("session '{session_id}' is unknown"))
}
