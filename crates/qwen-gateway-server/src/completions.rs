use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use metrics::{counter, histogram};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use qwen_gateway_core::{current_unix_timestamp, current_unix_timestamp_ms};
use qwen_gateway_store::{conversation_fingerprint, NewRequestRecord, NewResponseRecord, SessionRecord};

use crate::error::ApiError;
use crate::metrics::{
    upstream_error_kind, COMPLETIONS_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS,
    UPSTREAM_ERRORS_TOTAL,
};
use crate::openai::{validate_chat_request, ChatCompletionsRequest, ValidatedChat};
use crate::relay::{run_relay, RelayContext, SseFrame};
use crate::state::GatewayState;
use crate::transform::{build_completion, build_envelope, new_completion_id};

const CHAT_TITLE_MAX_CHARS: usize = 48;

pub(crate) async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ChatCompletionsRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return ApiError::invalid_request(format!("request body is not a chat request: {error}"))
                .into_response();
        }
    };
    let chat = match validate_chat_request(&request) {
        Ok(chat) => chat,
        Err(error) => return error.into_response(),
    };

    counter!(REQUESTS_TOTAL, "mode" => if chat.stream { "stream" } else { "blocking" })
        .increment(1);
    tracing::info!(
        model = %chat.model,
        stream = chat.stream,
        messages = chat.message_count,
        client = client_label(&state, &headers),
        "chat completion received"
    );

    let raw_inbound = String::from_utf8_lossy(&body).to_string();
    if chat.stream {
        handle_streaming(state, chat, raw_inbound).await
    } else {
        // The turn runs in its own task: a client that hangs up cannot
        // cancel the upstream call, the reply is still persisted and the
        // session still advances. Only the response body is lost.
        let task = tokio::spawn(execute_blocking(state, chat, raw_inbound));
        match task.await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(error = %error, "blocking completion task failed");
                ApiError::internal("completion task failed").into_response()
            }
        }
    }
}

fn client_label(state: &GatewayState, headers: &HeaderMap) -> String {
    if state.config.trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                return first.trim().to_string();
            }
        }
    }
    "direct".to_string()
}

fn chat_title(first_user_content: &str) -> String {
    let title: String = first_user_content
        .trim()
        .chars()
        .take(CHAT_TITLE_MAX_CHARS)
        .collect();
    if title.is_empty() {
        "New Chat".to_string()
    } else {
        title
    }
}

/// Maps the conversation onto its session row, creating the upstream chat
/// on first contact. Two racing first turns both create an upstream chat;
/// the session table's primary key picks the winner and the loser adopts
/// the winning row.
async fn resolve_session(
    state: &GatewayState,
    chat: &ValidatedChat,
) -> Result<SessionRecord, ApiError> {
    let session_id = conversation_fingerprint(&chat.first_user_content);
    let now_ms = current_unix_timestamp_ms();
    match state.store.get_session(&session_id, now_ms) {
        Ok(Some(session)) => Ok(session),
        Ok(None) => {
            let chat_id = state
                .upstream
                .create_chat(&chat_title(&chat.first_user_content), &[chat.model.clone()])
                .await
                .map_err(|error| {
                    counter!(UPSTREAM_ERRORS_TOTAL, "kind" => upstream_error_kind(&error))
                        .increment(1);
                    ApiError::from_upstream(&error)
                })?;
            tracing::info!(session_id = %session_id, chat_id = %chat_id, "created upstream chat");
            state
                .store
                .insert_session(&session_id, &chat_id, &chat.first_user_content, now_ms)
                .map_err(|error| ApiError::from_store(&error))
        }
        Err(error) => Err(ApiError::from_store(&error)),
    }
}

/// Writes the request row before the upstream call. A failure here is
/// logged and swallowed: the audit trail loses a row, the client loses
/// nothing.
fn persist_request(
    state: &GatewayState,
    session_id: &str,
    chat: &ValidatedChat,
    raw_inbound: &str,
    envelope_json: &str,
) -> Option<(String, i64)> {
    match state.store.log_request(
        NewRequestRecord {
            session_id,
            model: &chat.model,
            stream: chat.stream,
            inbound_body: raw_inbound,
            upstream_body: envelope_json,
        },
        current_unix_timestamp_ms(),
    ) {
        Ok(logged) => Some(logged),
        Err(error) => {
            tracing::warn!(error = %error, "failed to record request row");
            None
        }
    }
}

async fn execute_blocking(
    state: Arc<GatewayState>,
    chat: ValidatedChat,
    raw_inbound: String,
) -> Response {
    let session = match resolve_session(&state, &chat).await {
        Ok(session) => session,
        Err(error) => return error.into_response(),
    };
    let now_seconds = current_unix_timestamp();
    let envelope = build_envelope(&chat, &session, now_seconds);
    let envelope_json = match serde_json::to_string(&envelope) {
        Ok(encoded) => encoded,
        Err(error) => {
            return ApiError::internal(format!("failed to encode upstream envelope: {error}"))
                .into_response();
        }
    };
    let logged = persist_request(&state, &session.id, &chat, &raw_inbound, &envelope_json);

    let started = Instant::now();
    match state.upstream.send_message(&envelope).await {
        Ok((reply, raw_reply)) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            let now_ms = current_unix_timestamp_ms();
            let (finish_reason, error_message) = match reply.parent_id.as_deref() {
                Some(parent_id) => {
                    match state.store.update_session_parent(&session.id, parent_id, now_ms) {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(
                            session_id = %session.id,
                            "session vanished before parent update"
                        ),
                        Err(error) => tracing::warn!(
                            error = %error,
                            "failed to advance session parent"
                        ),
                    }
                    ("stop", None)
                }
                None => {
                    tracing::warn!(
                        session_id = %session.id,
                        "upstream reply carried no parent_id; session left unchanged"
                    );
                    ("error", Some("upstream reply did not include a parent_id"))
                }
            };

            let completion =
                build_completion(&new_completion_id(), &chat.model, &reply, now_seconds, finish_reason);
            let usage = reply.usage.unwrap_or_default();
            if let Some((_, request_pk)) = logged {
                let recorded = state.store.log_response(
                    NewResponseRecord {
                        request_pk,
                        session_id: &session.id,
                        upstream_body: Some(&raw_reply),
                        outbound_body: &completion.to_string(),
                        parent_id: reply.parent_id.as_deref(),
                        prompt_tokens: usage.prompt_tokens(),
                        completion_tokens: usage.completion_tokens(),
                        total_tokens: usage.total_tokens(),
                        finish_reason: Some(finish_reason),
                        error_message,
                        duration_ms,
                    },
                    now_ms,
                );
                if let Err(error) = recorded {
                    tracing::warn!(error = %error, "failed to record response row");
                }
            }

            counter!(COMPLETIONS_TOTAL, "mode" => "blocking", "outcome" => if error_message.is_none() { "ok" } else { "error" })
                .increment(1);
            histogram!(REQUEST_DURATION_SECONDS).record(duration_ms as f64 / 1_000.0);
            Json(completion).into_response()
        }
        Err(error) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            counter!(UPSTREAM_ERRORS_TOTAL, "kind" => upstream_error_kind(&error)).increment(1);
            counter!(COMPLETIONS_TOTAL, "mode" => "blocking", "outcome" => "error").increment(1);
            let api_error = ApiError::from_upstream(&error);
            if let Some((_, request_pk)) = logged {
                let recorded = state.store.log_response(
                    NewResponseRecord {
                        request_pk,
                        session_id: &session.id,
                        upstream_body: None,
                        outbound_body: &api_error.envelope().to_string(),
                        parent_id: None,
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        total_tokens: 0,
                        finish_reason: Some("error"),
                        error_message: Some(&error.to_string()),
                        duration_ms,
                    },
                    current_unix_timestamp_ms(),
                );
                if let Err(error) = recorded {
                    tracing::warn!(error = %error, "failed to record error response row");
                }
            }
            api_error.into_response()
        }
    }
}

async fn handle_streaming(
    state: Arc<GatewayState>,
    chat: ValidatedChat,
    raw_inbound: String,
) -> Response {
    // Session setup happens before any byte is written, so setup failures
    // still surface as plain HTTP errors rather than SSE frames.
    let session = match resolve_session(&state, &chat).await {
        Ok(session) => session,
        Err(error) => return error.into_response(),
    };
    let now_seconds = current_unix_timestamp();
    let envelope = build_envelope(&chat, &session, now_seconds);
    let envelope_json = match serde_json::to_string(&envelope) {
        Ok(encoded) => encoded,
        Err(error) => {
            return ApiError::internal(format!("failed to encode upstream envelope: {error}"))
                .into_response();
        }
    };
    let logged = persist_request(&state, &session.id, &chat, &raw_inbound, &envelope_json);

    let ctx = RelayContext {
        session_id: session.id.clone(),
        request_pk: logged.map(|(_, request_pk)| request_pk),
        model: chat.model.clone(),
        stream_id: new_completion_id(),
        created_seconds: now_seconds,
    };
    let (tx, rx) = mpsc::unbounded_channel::<SseFrame>();
    tokio::spawn(run_relay(Arc::clone(&state), envelope, ctx, tx));

    let stream =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.into_event()));
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
