use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

/// Inbound OpenAI chat-completions body. Unknown fields are collected and
/// preserved for the audit trail rather than rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// OpenAI message content is either a plain string or a list of typed
/// parts. Only text parts carry meaning for this upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Flattens to the canonical text form: strings pass through, part
    /// lists join their text parts in order.
    pub fn canonical_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// The validated view of a chat request the orchestrator works from.
#[derive(Debug, Clone)]
pub struct ValidatedChat {
    pub model: String,
    pub stream: bool,
    /// Canonical content of the first user message; the conversation's
    /// stable identity.
    pub first_user_content: String,
    pub last_role: String,
    pub last_content: String,
    pub message_count: usize,
}

const KNOWN_ROLES: [&str; 3] = ["system", "user", "assistant"];

/// Enforces the inbound contract: non-empty `messages`, known roles,
/// non-empty content per entry, at least one user message, and a model id.
pub fn validate_chat_request(request: &ChatCompletionsRequest) -> Result<ValidatedChat, ApiError> {
    let model = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::invalid_request("model must be a non-empty string"))?;

    if request.messages.is_empty() {
        return Err(ApiError::invalid_request(
            "messages must include at least one item",
        ));
    }

    let mut first_user_content: Option<String> = None;
    let mut last: Option<(&str, String)> = None;

    for (index, message) in request.messages.iter().enumerate() {
        let role = message.role.trim();
        if !KNOWN_ROLES.contains(&role) {
            return Err(ApiError::invalid_request(format!(
                "messages[{index}].role must be one of: system, user, assistant"
            )));
        }
        let content = message
            .content
            .as_ref()
            .map(MessageContent::canonical_text)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ApiError::invalid_request(format!(
                "messages[{index}].content must be non-empty"
            )));
        }
        if role == "user" && first_user_content.is_none() {
            first_user_content = Some(content.clone());
        }
        last = Some((role, content));
    }

    let first_user_content = first_user_content
        .ok_or_else(|| ApiError::invalid_request("messages must include a user message"))?;
    let (last_role, last_content) = last.unwrap_or(("user", String::new()));

    Ok(ValidatedChat {
        model: model.to_string(),
        stream: request.stream,
        first_user_content,
        last_role: last_role.to_string(),
        last_content,
        message_count: request.messages.len(),
    })
}
