use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::sse::Event;
use futures_util::StreamExt;
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use qwen_gateway_core::current_unix_timestamp_ms;
use qwen_gateway_store::NewResponseRecord;
use qwen_gateway_upstream::{MessageEnvelope, UpstreamError, UpstreamUsage};

use crate::error::ApiError;
use crate::metrics::{
    upstream_error_kind, COMPLETIONS_TOTAL, REQUEST_DURATION_SECONDS, STREAM_DISCONNECTS_TOTAL,
    UPSTREAM_ERRORS_TOTAL,
};
use crate::state::GatewayState;
use crate::transform::{
    build_content_chunk, build_finish_chunk, build_role_chunk, build_usage_chunk, classify_frame,
    UpstreamFrame,
};

/// One outbound SSE frame: a JSON chunk or the literal `[DONE]` sentinel.
#[derive(Debug)]
pub(crate) enum SseFrame {
    Json(Value),
    Done,
}

impl SseFrame {
    pub(crate) fn into_event(self) -> Event {
        match self {
            Self::Json(payload) => Event::default().data(payload.to_string()),
            Self::Done => Event::default().data("[DONE]"),
        }
    }
}

/// Everything the relay needs to finish the turn after the handler has
/// already returned the response headers.
pub(crate) struct RelayContext {
    pub(crate) session_id: String,
    pub(crate) request_pk: Option<i64>,
    pub(crate) model: String,
    pub(crate) stream_id: String,
    pub(crate) created_seconds: u64,
}

#[derive(Debug, Default)]
struct RelayOutcome {
    parent_id: Option<String>,
    usage: Option<UpstreamUsage>,
    finished: bool,
    client_disconnected: bool,
    error_message: Option<String>,
    content_chars: usize,
}

/// Drives one streaming turn: opens the upstream read, translates frames,
/// and on completion updates the session and writes the response row. Runs
/// in its own task; the handler only holds the receiving end.
pub(crate) async fn run_relay(
    state: Arc<GatewayState>,
    envelope: MessageEnvelope,
    ctx: RelayContext,
    tx: UnboundedSender<SseFrame>,
) {
    let started = Instant::now();
    let mut outcome = RelayOutcome::default();

    let idle_timeout = Duration::from_millis(state.config.upstream_timeout_ms.max(1));
    match state.upstream.send_message_stream(&envelope).await {
        Ok(response) => {
            relay_stream(&ctx, response, &tx, &mut outcome, idle_timeout).await;
        }
        Err(error) => {
            counter!(UPSTREAM_ERRORS_TOTAL, "kind" => upstream_error_kind(&error)).increment(1);
            outcome.error_message = Some(error.to_string());
            send_error_frames(&tx, &error);
        }
    }

    finalize(&state, &ctx, outcome, started);
}

async fn relay_stream(
    ctx: &RelayContext,
    response: reqwest::Response,
    tx: &UnboundedSender<SseFrame>,
    outcome: &mut RelayOutcome,
    idle_timeout: Duration,
) {
    let mut stream = response.bytes_stream();
    // Byte-level carry buffer: a frame (or a UTF-8 sequence) may be split
    // across two network reads and must never be forwarded half-parsed.
    let mut buffer: Vec<u8> = Vec::new();
    let mut sent_role = false;

    'read: loop {
        let chunk = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) => {
                let error = UpstreamError::Timeout(idle_timeout.as_millis() as u64);
                counter!(UPSTREAM_ERRORS_TOTAL, "kind" => "stream_idle").increment(1);
                outcome.error_message = Some("upstream stream idle timeout".to_string());
                send_error_frames(tx, &error);
                return;
            }
        };
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(error) => {
                let error = UpstreamError::Transient(error.to_string());
                counter!(UPSTREAM_ERRORS_TOTAL, "kind" => "mid_stream").increment(1);
                outcome.error_message = Some(error.to_string());
                send_error_frames(tx, &error);
                return;
            }
        };
        buffer.extend_from_slice(&bytes);

        while let Some(pos) = buffer.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if !process_line(ctx, &line, tx, outcome, &mut sent_role) {
                break 'read;
            }
        }
    }

    if !outcome.finished && !outcome.client_disconnected && outcome.error_message.is_none() {
        // Trailing data without a newline, then orderly termination even if
        // upstream never sent an explicit finish frame.
        let trailing: Vec<u8> = std::mem::take(&mut buffer);
        if !trailing.is_empty() {
            process_line(ctx, &trailing, tx, outcome, &mut sent_role);
        }
        if !outcome.finished && !outcome.client_disconnected {
            send_termination(ctx, tx, outcome);
        }
    }
}

/// Handles one raw line from the upstream body. Returns false when the read
/// loop should stop (client gone or stream finished).
fn process_line(
    ctx: &RelayContext,
    line: &[u8],
    tx: &UnboundedSender<SseFrame>,
    outcome: &mut RelayOutcome,
    sent_role: &mut bool,
) -> bool {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return true;
    };
    let data = data.trim();
    if data == "[DONE]" {
        send_termination(ctx, tx, outcome);
        return false;
    }

    let frame: Value = match serde_json::from_str(data) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(error = %error, "skipping unparseable upstream frame");
            return true;
        }
    };

    if let Some(usage) = frame
        .get("usage")
        .and_then(|usage| serde_json::from_value::<UpstreamUsage>(usage.clone()).ok())
    {
        outcome.usage = Some(usage);
    }

    match classify_frame(&frame) {
        UpstreamFrame::Metadata { parent_id } => {
            if let Some(parent_id) = parent_id {
                outcome.parent_id = Some(parent_id);
            }
        }
        UpstreamFrame::RoleOpening { .. } => {
            if !*sent_role {
                *sent_role = true;
                if !forward(
                    tx,
                    build_role_chunk(&ctx.stream_id, &ctx.model, ctx.created_seconds),
                    outcome,
                ) {
                    return false;
                }
            }
        }
        UpstreamFrame::ContentDelta { content } => {
            outcome.content_chars += content.chars().count();
            if !forward(
                tx,
                build_content_chunk(&ctx.stream_id, &ctx.model, ctx.created_seconds, &content),
                outcome,
            ) {
                return false;
            }
        }
        UpstreamFrame::Finish { usage } => {
            if let Some(usage) = usage {
                outcome.usage = Some(usage);
            }
            send_termination(ctx, tx, outcome);
            return false;
        }
        UpstreamFrame::Ignored => {}
    }
    true
}

/// Terminating chunk, usage-only chunk, then the `[DONE]` sentinel.
fn send_termination(ctx: &RelayContext, tx: &UnboundedSender<SseFrame>, outcome: &mut RelayOutcome) {
    outcome.finished = true;
    if !forward(
        tx,
        build_finish_chunk(&ctx.stream_id, &ctx.model, ctx.created_seconds),
        outcome,
    ) {
        return;
    }
    if !forward(
        tx,
        build_usage_chunk(
            &ctx.stream_id,
            &ctx.model,
            ctx.created_seconds,
            outcome.usage.unwrap_or_default(),
        ),
        outcome,
    ) {
        return;
    }
    let _ = tx.send(SseFrame::Done);
}

/// Sending fails exactly when the client hung up; the caller then stops
/// reading upstream so no further bytes are wasted.
fn forward(tx: &UnboundedSender<SseFrame>, payload: Value, outcome: &mut RelayOutcome) -> bool {
    if tx.send(SseFrame::Json(payload)).is_err() {
        outcome.client_disconnected = true;
        counter!(STREAM_DISCONNECTS_TOTAL).increment(1);
        tracing::debug!("client disconnected mid-stream, aborting upstream read");
        return false;
    }
    true
}

/// Best-effort error delivery after the 200 header is already out: one
/// OpenAI error envelope frame, then `[DONE]`.
fn send_error_frames(tx: &UnboundedSender<SseFrame>, error: &UpstreamError) {
    let api_error = ApiError::from_upstream(error);
    let _ = tx.send(SseFrame::Json(api_error.envelope()));
    let _ = tx.send(SseFrame::Done);
}

fn finalize(state: &Arc<GatewayState>, ctx: &RelayContext, outcome: RelayOutcome, started: Instant) {
    let now_ms = current_unix_timestamp_ms();
    if let Some(parent_id) = outcome.parent_id.as_deref() {
        match state
            .store
            .update_session_parent(&ctx.session_id, parent_id, now_ms)
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(session_id = %ctx.session_id, "session vanished before parent update")
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to advance session parent after stream")
            }
        }
    } else if outcome.error_message.is_none() {
        tracing::warn!(
            session_id = %ctx.session_id,
            "stream ended without a parent_id; session left unchanged"
        );
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let finish_reason = if outcome.finished && outcome.error_message.is_none() {
        "stop"
    } else {
        "error"
    };
    let usage = outcome.usage.unwrap_or_default();
    let outbound = json!({
        "id": ctx.stream_id,
        "object": "chat.completion.chunk",
        "model": ctx.model,
        "created": ctx.created_seconds,
        "stream": true,
        "content_chars": outcome.content_chars,
        "client_disconnected": outcome.client_disconnected,
        "finish_reason": finish_reason,
    });

    let outcome_label = if outcome.client_disconnected {
        "disconnect"
    } else if outcome.error_message.is_some() {
        "error"
    } else {
        "ok"
    };
    counter!(COMPLETIONS_TOTAL, "mode" => "stream", "outcome" => outcome_label).increment(1);
    histogram!(REQUEST_DURATION_SECONDS).record(duration_ms as f64 / 1_000.0);

    let Some(request_pk) = ctx.request_pk else {
        // The request row never made it in; there is nothing to link a
        // response row to.
        return;
    };
    let error_message = match (&outcome.error_message, outcome.client_disconnected) {
        (Some(message), _) => Some(message.clone()),
        (None, true) => Some("client disconnected mid-stream".to_string()),
        (None, false) if !outcome.finished => Some("stream ended without finish frame".to_string()),
        _ => None,
    };
    let logged = state.store.log_response(
        NewResponseRecord {
            request_pk,
            session_id: &ctx.session_id,
            upstream_body: None,
            outbound_body: &outbound.to_string(),
            parent_id: outcome.parent_id.as_deref(),
            prompt_tokens: usage.prompt_tokens(),
            completion_tokens: usage.completion_tokens(),
            total_tokens: usage.total_tokens(),
            finish_reason: Some(finish_reason),
            error_message: error_message.as_deref(),
            duration_ms,
        },
        now_ms,
    );
    if let Err(error) = logged {
        tracing::warn!(error = %error, "failed to record streaming response row");
    }
}
