//! Upstream Qwen chat service client: credential material, wire types,
//! retry policy, and the three upstream operations (list models, create
//! chat, send message).
mod client;
mod credentials;
mod retry;
mod types;

pub use client::{QwenClient, QwenClientConfig};
pub use credentials::UpstreamCredentials;
pub use retry::RetryPolicy;
pub use types::{
    ChatCreated, ChatCreatedData, FeatureConfig, MessageEnvelope, ModelCapabilities, ModelEntry,
    ModelInfo, ModelMeta, UpstreamChoice, UpstreamError, UpstreamMessage, UpstreamReply,
    UpstreamReplyMessage, UpstreamUsage,
};
