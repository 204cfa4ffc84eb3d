use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by upstream calls, tagged so the orchestrator can route
/// each kind (retry, report, or refuse).
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("upstream rejected the request with an anti-bot challenge")]
    AuthChallenge,
    #[error("upstream rejected parent pointer: {0}")]
    InvalidParent(String),
    #[error("upstream reported an error: {0}")]
    SemanticError(String),
    #[error("upstream call exceeded {0} ms")]
    Timeout(u64),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Classifies a reqwest transport error into the retryable variants.
    pub fn from_transport(error: reqwest::Error, timeout_ms: u64) -> Self {
        if error.is_timeout() {
            Self::Timeout(timeout_ms)
        } else {
            Self::Transient(error.to_string())
        }
    }

    /// Only transport-level failures and upstream 5xx are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout(_) => true,
            Self::UpstreamStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Per-message generation controls the upstream requires on every turn.
pub struct FeatureConfig {
    pub thinking_enabled: bool,
    pub output_schema: String,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            thinking_enabled: false,
            output_schema: "phase".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
/// One message in the upstream chat tree. The gateway only ever sends a
/// single user turn; context is reconstructed server-side from the parent
/// pointer.
pub struct UpstreamMessage {
    pub fid: String,
    /// Upstream expects the parent pointer under both spellings.
    #[serde(rename = "parentId")]
    pub parent_id_camel: Option<String>,
    pub parent_id: Option<String>,
    #[serde(rename = "childrenIds")]
    pub children_ids: Vec<String>,
    pub role: String,
    pub content: String,
    pub user_action: String,
    pub files: Vec<Value>,
    /// Whole seconds since epoch. Milliseconds provoke upstream rejection.
    pub timestamp: u64,
    pub models: Vec<String>,
    pub chat_type: String,
    pub sub_chat_type: String,
    pub feature_config: FeatureConfig,
    pub extra: Value,
}

impl UpstreamMessage {
    pub fn single_turn(
        role: &str,
        content: &str,
        parent_id: Option<&str>,
        model: &str,
        timestamp: u64,
    ) -> Self {
        Self {
            fid: Uuid::new_v4().to_string(),
            parent_id_camel: parent_id.map(str::to_string),
            parent_id: parent_id.map(str::to_string),
            children_ids: Vec::new(),
            role: role.to_string(),
            content: content.to_string(),
            user_action: "chat".to_string(),
            files: Vec::new(),
            timestamp,
            models: vec![model.to_string()],
            chat_type: "t2t".to_string(),
            sub_chat_type: "t2t".to_string(),
            feature_config: FeatureConfig::default(),
            extra: json!({ "meta": { "subChatType": "t2t" } }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
/// The request body for one turn against an existing upstream chat.
pub struct MessageEnvelope {
    pub chat_id: String,
    pub parent_id: Option<String>,
    pub stream: bool,
    pub incremental_output: bool,
    pub chat_mode: String,
    pub model: String,
    pub timestamp: u64,
    pub messages: Vec<UpstreamMessage>,
}

#[derive(Debug, Clone, Deserialize)]
/// Decoded blocking-mode reply.
pub struct UpstreamReply {
    pub parent_id: Option<String>,
    pub message_id: Option<String>,
    #[serde(default)]
    pub choices: Vec<UpstreamChoice>,
    pub usage: Option<UpstreamUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamChoice {
    pub message: UpstreamReplyMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamReplyMessage {
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UpstreamUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

impl UpstreamUsage {
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens.unwrap_or(0)
    }

    pub fn completion_tokens(&self) -> u64 {
        self.output_tokens.unwrap_or(0)
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens() + self.completion_tokens()
    }
}

#[derive(Debug, Clone, Deserialize)]
/// Native model list entry as upstream reports it.
pub struct ModelEntry {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub info: ModelInfo,
}

impl ModelEntry {
    pub fn is_active(&self) -> bool {
        self.info.is_active.unwrap_or(true)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub meta: ModelMeta,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMeta {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub max_context_length: Option<u64>,
    #[serde(default)]
    pub max_generation_length: Option<u64>,
    #[serde(default)]
    pub chat_type: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub document: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub citations: bool,
}

#[derive(Debug, Clone, Deserialize)]
/// `POST /api/v2/chats/new` reply wrapper.
pub struct ChatCreated {
    pub data: ChatCreatedData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCreatedData {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_turn_message_carries_parent_under_both_spellings() {
        let message =
            UpstreamMessage::single_turn("user", "hi", Some("P1"), "qwen3-max", 1_700_000_000);
        let encoded = serde_json::to_value(&message).expect("message must serialize");
        assert_eq!(encoded["parentId"], "P1");
        assert_eq!(encoded["parent_id"], "P1");
        assert_eq!(encoded["childrenIds"], json!([]));
        assert_eq!(encoded["user_action"], "chat");
        assert_eq!(encoded["chat_type"], "t2t");
        assert_eq!(encoded["sub_chat_type"], "t2t");
        assert_eq!(encoded["feature_config"]["thinking_enabled"], false);
        assert_eq!(encoded["feature_config"]["output_schema"], "phase");
        assert_eq!(encoded["extra"]["meta"]["subChatType"], "t2t");
        assert_eq!(encoded["timestamp"], 1_700_000_000_u64);
        assert!(!encoded["fid"].as_str().expect("fid").is_empty());
    }

    #[test]
    fn first_turn_message_serializes_null_parents() {
        let message = UpstreamMessage::single_turn("user", "hi", None, "qwen3-max", 1);
        let encoded = serde_json::to_value(&message).expect("message must serialize");
        assert!(encoded["parentId"].is_null());
        assert!(encoded["parent_id"].is_null());
    }

    #[test]
    fn usage_totals_default_missing_fields_to_zero() {
        let usage: UpstreamUsage = serde_json::from_str(r#"{"input_tokens": 3}"#).expect("usage");
        assert_eq!(usage.prompt_tokens(), 3);
        assert_eq!(usage.completion_tokens(), 0);
        assert_eq!(usage.total_tokens(), 3);
    }

    #[test]
    fn model_entry_defaults_to_active_when_flag_absent() {
        let entry: ModelEntry =
            serde_json::from_str(r#"{"id":"qwen3-max"}"#).expect("model entry");
        assert!(entry.is_active());
        assert_eq!(entry.display_name(), "qwen3-max");
    }

    #[test]
    fn transient_classification_covers_5xx_only() {
        assert!(UpstreamError::Transient("reset".to_string()).is_transient());
        assert!(UpstreamError::Timeout(60_000).is_transient());
        assert!(UpstreamError::UpstreamStatus {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!UpstreamError::UpstreamStatus {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!UpstreamError::AuthChallenge.is_transient());
        assert!(!UpstreamError::InvalidParent("gone".to_string()).is_transient());
    }
}
