use httpmock::prelude::*;
use serde_json::json;

use qwen_gateway_upstream::{
    MessageEnvelope, QwenClient, QwenClientConfig, RetryPolicy, UpstreamCredentials, UpstreamError,
    UpstreamMessage,
};

fn test_credentials() -> UpstreamCredentials {
    UpstreamCredentials::new("test-umid-token", "token=test-cookie")
        .expect("test credentials should build")
}

fn test_client(base_url: String) -> QwenClient {
    test_client_with_retry(
        base_url,
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        },
    )
}

fn test_client_with_retry(base_url: String, retry: RetryPolicy) -> QwenClient {
    QwenClient::new(
        &test_credentials(),
        QwenClientConfig {
            base_url,
            request_timeout_ms: 5_000,
            retry,
        },
    )
    .expect("client should build")
}

fn single_turn_envelope(chat_id: &str, parent_id: Option<&str>, content: &str) -> MessageEnvelope {
    MessageEnvelope {
        chat_id: chat_id.to_string(),
        parent_id: parent_id.map(str::to_string),
        stream: false,
        incremental_output: true,
        chat_mode: "guest".to_string(),
        model: "qwen3-max".to_string(),
        timestamp: 1_700_000_000,
        messages: vec![UpstreamMessage::single_turn(
            "user",
            content,
            parent_id,
            "qwen3-max",
            1_700_000_000,
        )],
    }
}

#[tokio::test]
async fn list_models_sends_required_headers_and_parses_entries() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/api/models")
            .header("bx-umidtoken", "test-umid-token")
            .header("cookie", "token=test-cookie")
            .header("content-type", "application/json");
        then.status(200).json_body(json!({
            "data": [
                {
                    "id": "qwen3-max",
                    "name": "Qwen3-Max",
                    "info": {
                        "is_active": true,
                        "meta": {
                            "capabilities": {"vision": true, "document": true},
                            "max_context_length": 262144,
                            "max_generation_length": 32768,
                            "chat_type": ["t2t"]
                        }
                    }
                },
                {
                    "id": "qwen-dormant",
                    "info": {"is_active": false}
                }
            ]
        }));
    });

    let client = test_client(server.base_url());
    let models = client.list_models().await.expect("models should list");

    mock.assert();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id, "qwen3-max");
    assert_eq!(models[0].display_name(), "Qwen3-Max");
    assert!(models[0].is_active());
    assert!(models[0].info.meta.capabilities.vision);
    assert_eq!(models[0].info.meta.max_context_length, Some(262_144));
    assert!(!models[1].is_active());
}

#[tokio::test]
async fn create_chat_posts_guest_mode_body_and_returns_chat_id() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v2/chats/new")
            .header("bx-umidtoken", "test-umid-token")
            .json_body_includes(
                json!({
                    "title": "gateway chat",
                    "models": ["qwen3-max"],
                    "chat_mode": "guest",
                    "chat_type": "t2t"
                })
                .to_string(),
            );
        then.status(200)
            .json_body(json!({"data": {"id": "chat-001"}}));
    });

    let client = test_client(server.base_url());
    let chat_id = client
        .create_chat("gateway chat", &["qwen3-max".to_string()])
        .await
        .expect("chat should be created");

    mock.assert();
    assert_eq!(chat_id, "chat-001");
}

#[tokio::test]
async fn send_message_decodes_blocking_reply_with_parent_pointer() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v2/chat/completions")
            .query_param("chat_id", "chat-001")
            .json_body_includes(
                json!({
                    "chat_id": "chat-001",
                    "incremental_output": true,
                    "chat_mode": "guest",
                    "messages": [{"role": "user", "content": "hi", "user_action": "chat"}]
                })
                .to_string(),
            );
        then.status(200).json_body(json!({
            "parent_id": "P1",
            "message_id": "M1",
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"input_tokens": 1, "output_tokens": 2}
        }));
    });

    let client = test_client(server.base_url());
    let (reply, raw) = client
        .send_message(&single_turn_envelope("chat-001", None, "hi"))
        .await
        .expect("blocking reply should decode");

    mock.assert();
    assert!(raw.contains("\"parent_id\":\"P1\""));
    assert_eq!(reply.parent_id.as_deref(), Some("P1"));
    assert_eq!(reply.message_id.as_deref(), Some("M1"));
    assert_eq!(reply.choices[0].message.content, "hello");
    let usage = reply.usage.expect("usage");
    assert_eq!(usage.total_tokens(), 3);
}

#[tokio::test]
async fn transient_5xx_is_retried_then_surfaced_after_exhaustion() {
    let server = MockServer::start();
    let failure = server.mock(|when, then| {
        when.method(GET).path("/api/models");
        then.status(503).body("unavailable");
    });

    let client = test_client_with_retry(
        server.base_url(),
        RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 10,
            max_delay_ms: 20,
            multiplier: 2,
        },
    );

    let error = client
        .list_models()
        .await
        .expect_err("exhausted retries should fail");
    assert!(matches!(
        error,
        UpstreamError::UpstreamStatus { status: 503, .. }
    ));
    // First try plus one retry.
    failure.assert_hits(2);
}

#[tokio::test]
async fn semantic_4xx_is_not_retried() {
    let server = MockServer::start();
    let failure = server.mock(|when, then| {
        when.method(POST).path("/api/v2/chat/completions");
        then.status(400)
            .json_body(json!({"message": "parent_id zz-1 not exist"}));
    });

    let client = test_client_with_retry(
        server.base_url(),
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 20,
            multiplier: 2,
        },
    );

    let error = client
        .send_message(&single_turn_envelope("chat-001", Some("zz-1"), "hi"))
        .await
        .expect_err("invalid parent should fail");
    assert!(matches!(error, UpstreamError::InvalidParent(_)));
    failure.assert_hits(1);
}

#[tokio::test]
async fn html_challenge_maps_to_auth_error_without_retry() {
    let server = MockServer::start();
    let challenge = server.mock(|when, then| {
        when.method(GET).path("/api/models");
        then.status(200)
            .header("content-type", "text/html")
            .body("<!DOCTYPE html><html><body>checking your browser</body></html>");
    });

    // The challenge page sometimes arrives with a 200.
    let client = test_client(server.base_url());
    let error = client
        .list_models()
        .await
        .expect_err("html body should map to auth error");
    assert!(matches!(error, UpstreamError::AuthChallenge));
    challenge.assert_hits(1);

    let denied = server.mock(|when, then| {
        when.method(POST).path("/api/v2/chats/new");
        then.status(403)
            .body("<!DOCTYPE html><html><body>denied</body></html>");
    });
    let error = client
        .create_chat("gateway chat", &["qwen3-max".to_string()])
        .await
        .expect_err("challenge should map to auth error");
    assert!(matches!(error, UpstreamError::AuthChallenge));
    denied.assert_hits(1);
}

#[tokio::test]
async fn send_message_stream_returns_open_sse_body() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/api/v2/chat/completions")
            .query_param("chat_id", "chat-001");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                "data: {\"response.created\":{\"parent_id\":\"P3\"}}\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n",
            ));
    });

    let client = test_client(server.base_url());
    let response = client
        .send_message_stream(&single_turn_envelope("chat-001", None, "hi"))
        .await
        .expect("stream should open");
    let body = response.text().await.expect("body should read");
    assert!(body.contains("response.created"));
    assert!(body.contains("\"content\":\"hello\""));
}
