use serde_json::{json, Value};
use uuid::Uuid;

use qwen_gateway_store::SessionRecord;
use qwen_gateway_upstream::{MessageEnvelope, UpstreamMessage, UpstreamReply, UpstreamUsage};

use crate::openai::ValidatedChat;

const CHAT_COMPLETION_OBJECT: &str = "chat.completion";
const CHAT_COMPLETION_CHUNK_OBJECT: &str = "chat.completion.chunk";

pub(crate) fn new_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

/// Builds the single-turn upstream envelope. The replayed history is
/// discarded on purpose: upstream reconstructs context from the parent
/// pointer, and a full replay both doubles context and gets rejected.
pub(crate) fn build_envelope(
    chat: &ValidatedChat,
    session: &SessionRecord,
    now_seconds: u64,
) -> MessageEnvelope {
    MessageEnvelope {
        chat_id: session.upstream_chat_id.clone(),
        parent_id: session.parent_id.clone(),
        stream: chat.stream,
        incremental_output: true,
        chat_mode: "guest".to_string(),
        model: chat.model.clone(),
        timestamp: now_seconds,
        messages: vec![UpstreamMessage::single_turn(
            &chat.last_role,
            &chat.last_content,
            session.parent_id.as_deref(),
            &chat.model,
            now_seconds,
        )],
    }
}

/// Shapes a blocking upstream reply into the OpenAI completion object.
pub(crate) fn build_completion(
    completion_id: &str,
    model: &str,
    reply: &UpstreamReply,
    created_seconds: u64,
    finish_reason: &str,
) -> Value {
    let content = reply
        .choices
        .first()
        .map(|choice| choice.message.content.clone())
        .unwrap_or_default();
    let usage = reply.usage.unwrap_or_default();
    json!({
        "id": completion_id,
        "object": CHAT_COMPLETION_OBJECT,
        "created": created_seconds,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": content,
            },
            "finish_reason": finish_reason,
        }],
        "usage": usage_value(usage),
    })
}

pub(crate) fn build_role_chunk(stream_id: &str, model: &str, created_seconds: u64) -> Value {
    chunk(stream_id, model, created_seconds, json!({"role": "assistant"}), Value::Null)
}

pub(crate) fn build_content_chunk(
    stream_id: &str,
    model: &str,
    created_seconds: u64,
    content: &str,
) -> Value {
    chunk(
        stream_id,
        model,
        created_seconds,
        json!({"content": content}),
        Value::Null,
    )
}

pub(crate) fn build_finish_chunk(stream_id: &str, model: &str, created_seconds: u64) -> Value {
    chunk(stream_id, model, created_seconds, json!({}), json!("stop"))
}

/// Trailing usage-only chunk: empty `choices`, populated `usage`.
pub(crate) fn build_usage_chunk(
    stream_id: &str,
    model: &str,
    created_seconds: u64,
    usage: UpstreamUsage,
) -> Value {
    json!({
        "id": stream_id,
        "object": CHAT_COMPLETION_CHUNK_OBJECT,
        "created": created_seconds,
        "model": model,
        "choices": [],
        "usage": usage_value(usage),
    })
}

fn chunk(
    stream_id: &str,
    model: &str,
    created_seconds: u64,
    delta: Value,
    finish_reason: Value,
) -> Value {
    json!({
        "id": stream_id,
        "object": CHAT_COMPLETION_CHUNK_OBJECT,
        "created": created_seconds,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

fn usage_value(usage: UpstreamUsage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens(),
        "completion_tokens": usage.completion_tokens(),
        "total_tokens": usage.total_tokens(),
    })
}

/// One upstream streaming frame, classified for the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    /// Carries the next parent pointer; consumed, never forwarded.
    Metadata { parent_id: Option<String> },
    /// Opens the assistant turn without content.
    RoleOpening { role: String },
    ContentDelta { content: String },
    /// Terminal frame; usage usually rides along.
    Finish { usage: Option<UpstreamUsage> },
    /// Anything else (keep-alives, unknown shapes). Skipped.
    Ignored,
}

pub fn classify_frame(frame: &Value) -> UpstreamFrame {
    if frame.get("response.created").is_some() {
        return UpstreamFrame::Metadata {
            parent_id: extract_parent_id(frame),
        };
    }

    let Some(delta) = frame.pointer("/choices/0/delta") else {
        return UpstreamFrame::Ignored;
    };
    let status = delta
        .get("status")
        .or_else(|| frame.pointer("/choices/0/status"))
        .and_then(Value::as_str);
    if status == Some("finished") {
        let usage = frame
            .get("usage")
            .and_then(|usage| serde_json::from_value(usage.clone()).ok());
        return UpstreamFrame::Finish { usage };
    }
    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            return UpstreamFrame::ContentDelta {
                content: content.to_string(),
            };
        }
    }
    if let Some(role) = delta.get("role").and_then(Value::as_str) {
        return UpstreamFrame::RoleOpening {
            role: role.to_string(),
        };
    }
    UpstreamFrame::Ignored
}

/// Pulls the chain cursor out of a frame or blocking reply. Deliberately
/// never reads `message_id` — that identifies the assistant message itself,
/// not the attach point for the next turn.
pub fn extract_parent_id(frame: &Value) -> Option<String> {
    if let Some(parent) = frame
        .pointer("/response.created/parent_id")
        .and_then(Value::as_str)
    {
        return Some(parent.to_string());
    }
    frame
        .get("parent_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{validate_chat_request, ChatCompletionsRequest};

    fn validated(raw: &str) -> ValidatedChat {
        let request: ChatCompletionsRequest = serde_json::from_str(raw).expect("request parses");
        validate_chat_request(&request).expect("request validates")
    }

    fn session(parent_id: Option<&str>) -> SessionRecord {
        SessionRecord {
            id: "fp".to_string(),
            upstream_chat_id: "chat-001".to_string(),
            parent_id: parent_id.map(str::to_string),
            first_user_message: "hi".to_string(),
            message_count: if parent_id.is_some() { 1 } else { 0 },
            created_at: 0,
            last_accessed: 0,
            expires_at: 0,
        }
    }

    #[test]
    fn envelope_carries_exactly_the_last_message() {
        let chat = validated(
            r#"{"model":"qwen3-max","messages":[
                {"role":"user","content":"hi"},
                {"role":"assistant","content":"hello"},
                {"role":"user","content":"who are you?"}
            ],"stream":false}"#,
        );
        let envelope = build_envelope(&chat, &session(Some("P1")), 1_700_000_000);

        assert_eq!(envelope.chat_id, "chat-001");
        assert_eq!(envelope.parent_id.as_deref(), Some("P1"));
        assert_eq!(envelope.messages.len(), 1);
        assert_eq!(envelope.messages[0].role, "user");
        assert_eq!(envelope.messages[0].content, "who are you?");
        assert_eq!(envelope.messages[0].parent_id.as_deref(), Some("P1"));
        assert!(envelope.incremental_output);
        assert_eq!(envelope.chat_mode, "guest");
        assert_eq!(envelope.timestamp, 1_700_000_000);
    }

    #[test]
    fn first_turn_envelope_has_null_parent_everywhere() {
        let chat = validated(
            r#"{"model":"qwen3-max","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let envelope = build_envelope(&chat, &session(None), 1_700_000_000);
        assert!(envelope.parent_id.is_none());
        assert!(envelope.messages[0].parent_id.is_none());
        assert!(envelope.messages[0].parent_id_camel.is_none());
    }

    #[test]
    fn round_trip_preserves_the_last_message_exactly() {
        let chat = validated(
            r#"{"model":"qwen3-max","messages":[
                {"role":"user","content":"hi"},
                {"role":"user","content":"again"}
            ]}"#,
        );
        let envelope = build_envelope(&chat, &session(None), 7);
        let encoded = serde_json::to_value(&envelope).expect("envelope serializes");
        assert_eq!(encoded["messages"][0]["role"], chat.last_role);
        assert_eq!(encoded["messages"][0]["content"], chat.last_content);
    }

    #[test]
    fn blocking_reply_becomes_an_openai_completion() {
        let reply: UpstreamReply = serde_json::from_str(
            r#"{
                "parent_id": "P1",
                "message_id": "M1",
                "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                "usage": {"input_tokens": 1, "output_tokens": 2}
            }"#,
        )
        .expect("reply parses");
        let completion = build_completion("chatcmpl-test", "qwen3-max", &reply, 99, "stop");
        assert_eq!(completion["object"], "chat.completion");
        assert_eq!(completion["choices"][0]["message"]["content"], "hello");
        assert_eq!(completion["choices"][0]["finish_reason"], "stop");
        assert_eq!(completion["usage"]["prompt_tokens"], 1);
        assert_eq!(completion["usage"]["completion_tokens"], 2);
        assert_eq!(completion["usage"]["total_tokens"], 3);
        assert_eq!(completion["created"], 99);
    }

    #[test]
    fn missing_usage_defaults_to_zero() {
        let reply: UpstreamReply =
            serde_json::from_str(r#"{"parent_id": "P1", "choices": []}"#).expect("reply parses");
        let completion = build_completion("chatcmpl-test", "qwen3-max", &reply, 0, "stop");
        assert_eq!(completion["usage"]["total_tokens"], 0);
        assert_eq!(completion["choices"][0]["message"]["content"], "");
    }

    #[test]
    fn metadata_frames_classify_and_yield_the_parent() {
        let frame = serde_json::json!({"response.created": {"parent_id": "P3", "message_id": "M3"}});
        assert_eq!(
            classify_frame(&frame),
            UpstreamFrame::Metadata {
                parent_id: Some("P3".to_string())
            }
        );
    }

    #[test]
    fn delta_frames_classify_by_status_then_content_then_role() {
        let role = serde_json::json!({"choices":[{"delta":{"role":"assistant"}}]});
        assert_eq!(
            classify_frame(&role),
            UpstreamFrame::RoleOpening {
                role: "assistant".to_string()
            }
        );

        let content = serde_json::json!({"choices":[{"delta":{"content":"hel"}}]});
        assert_eq!(
            classify_frame(&content),
            UpstreamFrame::ContentDelta {
                content: "hel".to_string()
            }
        );

        let finish = serde_json::json!({
            "choices":[{"delta":{"content":"","status":"finished"}}],
            "usage":{"input_tokens":1,"output_tokens":2}
        });
        match classify_frame(&finish) {
            UpstreamFrame::Finish { usage } => {
                assert_eq!(usage.expect("usage").total_tokens(), 3);
            }
            other => panic!("expected finish frame, got {other:?}"),
        }

        let unknown = serde_json::json!({"ping": true});
        assert_eq!(classify_frame(&unknown), UpstreamFrame::Ignored);
    }

    #[test]
    fn parent_extraction_never_falls_back_to_message_id() {
        let metadata = serde_json::json!({"response.created": {"message_id": "M9"}});
        assert_eq!(extract_parent_id(&metadata), None);

        let blocking = serde_json::json!({"parent_id": "P1", "message_id": "M1"});
        assert_eq!(extract_parent_id(&blocking).as_deref(), Some("P1"));

        let bare = serde_json::json!({"message_id": "M1"});
        assert_eq!(extract_parent_id(&bare), None);
    }

    #[test]
    fn chunk_builders_reuse_one_stream_id() {
        let id = new_completion_id();
        assert!(id.starts_with("chatcmpl-"));
        let role = build_role_chunk(&id, "m", 5);
        let content = build_content_chunk(&id, "m", 5, "hi");
        let finish = build_finish_chunk(&id, "m", 5);
        let usage = build_usage_chunk(&id, "m", 5, UpstreamUsage::default());
        for value in [&role, &content, &finish, &usage] {
            assert_eq!(value["id"], serde_json::json!(id.as_str()));
            assert_eq!(value["object"], "chat.completion.chunk");
        }
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(content["choices"][0]["delta"]["content"], "hi");
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert!(finish["choices"][0]["delta"].as_object().expect("delta").is_empty());
        assert!(usage["choices"].as_array().expect("choices").is_empty());
        assert_eq!(usage["usage"]["total_tokens"], 0);
    }
}
