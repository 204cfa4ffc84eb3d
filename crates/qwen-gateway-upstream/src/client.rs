use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use qwen_gateway_core::current_unix_timestamp;

use crate::credentials::UpstreamCredentials;
use crate::retry::{is_retryable_transport_error, should_retry_status, RetryPolicy};
use crate::types::{ChatCreated, MessageEnvelope, ModelEntry, UpstreamError, UpstreamReply};

const MODELS_PATH: &str = "/api/models";
const NEW_CHAT_PATH: &str = "/api/v2/chats/new";
const COMPLETIONS_PATH: &str = "/api/v2/chat/completions";

#[derive(Debug, Clone)]
pub struct QwenClientConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct QwenClient {
    client: reqwest::Client,
    config: QwenClientConfig,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

impl QwenClient {
    pub fn new(
        credentials: &UpstreamCredentials,
        config: QwenClientConfig,
    ) -> Result<Self, UpstreamError> {
        let headers = credentials.headers()?;
        // Only the connect phase is bounded here; streaming bodies may stay
        // open far longer than any per-call budget. Blocking calls get a
        // full-request timeout per request below.
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .map_err(|error| UpstreamError::Transient(error.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms.max(1))
    }

    /// Fetches the upstream's native model list.
    pub async fn list_models(&self) -> Result<Vec<ModelEntry>, UpstreamError> {
        let url = self.url(MODELS_PATH);
        let timeout = self.request_timeout();
        let response = self
            .request_with_retry(|| self.client.get(&url).timeout(timeout))
            .await?;
        let raw = response
            .text()
            .await
            .map_err(|error| UpstreamError::from_transport(error, self.config.request_timeout_ms))?;
        let parsed: ModelList = decode_json_reply(&raw)?;
        Ok(parsed.data)
    }

    /// Creates a fresh upstream chat and returns its id.
    pub async fn create_chat(
        &self,
        title: &str,
        models: &[String],
    ) -> Result<String, UpstreamError> {
        let url = self.url(NEW_CHAT_PATH);
        let timeout = self.request_timeout();
        let body = json!({
            "title": title,
            "models": models,
            "chat_mode": "guest",
            "chat_type": "t2t",
            "timestamp": current_unix_timestamp(),
        });
        let response = self
            .request_with_retry(|| self.client.post(&url).timeout(timeout).json(&body))
            .await?;
        let raw = response
            .text()
            .await
            .map_err(|error| UpstreamError::from_transport(error, self.config.request_timeout_ms))?;
        let created: ChatCreated = decode_json_reply(&raw).map_err(|error| match error {
            UpstreamError::AuthChallenge => UpstreamError::AuthChallenge,
            _ => UpstreamError::InvalidResponse(format!("chat creation reply had no data.id: {raw}")),
        })?;
        Ok(created.data.id)
    }

    /// Sends one turn in blocking mode. Returns the decoded reply together
    /// with the verbatim body so the audit log can keep the original.
    pub async fn send_message(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<(UpstreamReply, String), UpstreamError> {
        let url = self.completions_url(&envelope.chat_id);
        let timeout = self.request_timeout();
        let response = self
            .request_with_retry(|| self.client.post(&url).timeout(timeout).json(envelope))
            .await?;
        let raw = response
            .text()
            .await
            .map_err(|error| UpstreamError::from_transport(error, self.config.request_timeout_ms))?;
        let reply = decode_json_reply(&raw)?;
        Ok((reply, raw))
    }

    /// Sends one turn in streaming mode. The returned response is positioned
    /// at the start of the SSE body; the caller owns the byte stream.
    pub async fn send_message_stream(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.completions_url(&envelope.chat_id);
        self.request_with_retry(|| self.client.post(&url).json(envelope))
            .await
    }

    fn completions_url(&self, chat_id: &str) -> String {
        format!("{}?chat_id={chat_id}", self.url(COMPLETIONS_PATH))
    }

    async fn request_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, UpstreamError> {
        let policy = self.config.retry;
        let mut attempt = 0usize;
        loop {
            let error = match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body = response.text().await.unwrap_or_default();
                    classify_failure(status.as_u16(), &body)
                }
                Err(error) if is_retryable_transport_error(&error) => {
                    UpstreamError::from_transport(error, self.config.request_timeout_ms)
                }
                Err(error) => return Err(UpstreamError::InvalidResponse(error.to_string())),
            };

            if error.is_transient() && policy.allows_retry(attempt) {
                let delay_ms = policy.delay_ms(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms,
                    error = %error,
                    "retrying transient upstream failure"
                );
                sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
                continue;
            }

            if matches!(error, UpstreamError::AuthChallenge) {
                tracing::error!(
                    "upstream served the anti-bot challenge; credentials likely expired"
                );
            }
            return Err(error);
        }
    }
}

/// The anti-bot layer sometimes serves its challenge page with a 200, so
/// every JSON decode first checks for HTML.
fn decode_json_reply<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, UpstreamError> {
    if looks_like_html_challenge(raw) {
        return Err(UpstreamError::AuthChallenge);
    }
    Ok(serde_json::from_str(raw)?)
}

/// Maps a non-success upstream reply onto the tagged error taxonomy. HTML
/// bodies are the anti-bot challenge regardless of status code.
pub(crate) fn classify_failure(status: u16, body: &str) -> UpstreamError {
    if looks_like_html_challenge(body) {
        return UpstreamError::AuthChallenge;
    }
    if status == 401 || status == 403 {
        return UpstreamError::AuthChallenge;
    }
    if should_retry_status(status) {
        return UpstreamError::UpstreamStatus {
            status,
            body: truncate_body(body),
        };
    }
    if let Some(message) = extract_error_message(body) {
        let normalized = message.to_ascii_lowercase();
        if normalized.contains("parent_id")
            && (normalized.contains("not exist") || normalized.contains("not found"))
        {
            return UpstreamError::InvalidParent(message);
        }
        return UpstreamError::SemanticError(message);
    }
    UpstreamError::UpstreamStatus {
        status,
        body: truncate_body(body),
    }
}

fn looks_like_html_challenge(body: &str) -> bool {
    let head = body.trim_start().get(..64).unwrap_or(body.trim_start());
    let lowered = head.to_ascii_lowercase();
    lowered.starts_with("<!doctype html") || lowered.starts_with("<html")
}

fn extract_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    for candidate in [
        parsed.get("message"),
        parsed.get("detail"),
        parsed.get("error").and_then(|error| error.get("message")),
        parsed.get("data").and_then(|data| data.get("message")),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(text) = candidate.as_str() {
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_bodies_classify_as_auth_challenge() {
        let body = "<!DOCTYPE html><html><body>Verifying your browser…</body></html>";
        assert!(matches!(
            classify_failure(200, body),
            UpstreamError::AuthChallenge
        ));
        assert!(matches!(
            classify_failure(403, "forbidden"),
            UpstreamError::AuthChallenge
        ));
    }

    #[test]
    fn missing_parent_messages_classify_as_invalid_parent() {
        let body = r#"{"code":"A1001","message":"parent_id abc-123 not exist"}"#;
        match classify_failure(400, body) {
            UpstreamError::InvalidParent(message) => {
                assert!(message.contains("abc-123"));
            }
            other => panic!("expected InvalidParent, got {other:?}"),
        }
    }

    #[test]
    fn coherent_4xx_messages_classify_as_semantic() {
        let body = r#"{"error":{"message":"model offline"}}"#;
        assert!(matches!(
            classify_failure(400, body),
            UpstreamError::SemanticError(message) if message == "model offline"
        ));
    }

    #[test]
    fn opaque_failures_keep_status_and_body() {
        match classify_failure(502, "bad gateway") {
            UpstreamError::UpstreamStatus { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("expected UpstreamStatus, got {other:?}"),
        }
        assert!(classify_failure(502, "bad gateway").is_transient());
        assert!(!classify_failure(404, "{}").is_transient());
    }

    #[test]
    fn oversized_error_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        match classify_failure(500, &body) {
            UpstreamError::UpstreamStatus { body, .. } => {
                assert!(body.len() < 600);
                assert!(body.ends_with('…'));
            }
            other => panic!("expected UpstreamStatus, got {other:?}"),
        }
    }
}
