//! OpenAI-compatible HTTP surface over the upstream Qwen chat service:
//! request validation, session resolution, envelope/response translation,
//! the streaming relay, audit endpoints, and server bootstrap.
mod audit;
mod completions;
mod config;
mod endpoints;
mod error;
mod metrics;
mod models;
mod openai;
mod relay;
mod server;
mod state;
mod status;
mod sweeper;
mod transform;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use crate::metrics::install_metrics_recorder;
pub use models::ModelsCache;
pub use openai::{ChatCompletionsRequest, ContentPart, InboundMessage, MessageContent, ValidatedChat};
pub use server::{build_router, run_server};
pub use state::GatewayState;
pub use sweeper::{start_session_sweeper, SessionSweeperHandle};
pub use transform::{classify_frame, extract_parent_id, UpstreamFrame};
