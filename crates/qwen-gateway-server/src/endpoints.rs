//! Shared endpoint and pagination constant definitions for the gateway.

pub(crate) const OPENAI_CHAT_COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";
pub(crate) const OPENAI_MODELS_ENDPOINT: &str = "/v1/models";
pub(crate) const OPENAI_MODEL_DETAIL_ENDPOINT: &str = "/v1/models/{model_id}";
pub(crate) const HEALTH_ENDPOINT: &str = "/health";
pub(crate) const METRICS_ENDPOINT: &str = "/metrics";
pub(crate) const SESSIONS_ENDPOINT: &str = "/v1/sessions";
pub(crate) const SESSION_DETAIL_ENDPOINT: &str = "/v1/sessions/{session_id}";
pub(crate) const SESSION_STATS_ENDPOINT: &str = "/v1/sessions/{session_id}/stats";
pub(crate) const SESSION_REQUESTS_ENDPOINT: &str = "/v1/sessions/{session_id}/requests";
pub(crate) const REQUESTS_ENDPOINT: &str = "/v1/requests";
pub(crate) const REQUEST_DETAIL_ENDPOINT: &str = "/v1/requests/{request_id}";
pub(crate) const REQUEST_RESPONSE_ENDPOINT: &str = "/v1/requests/{request_id}/response";
pub(crate) const RESPONSES_ENDPOINT: &str = "/v1/responses";
pub(crate) const RESPONSES_STATS_ENDPOINT: &str = "/v1/responses/stats";
pub(crate) const RESPONSE_DETAIL_ENDPOINT: &str = "/v1/responses/{response_id}";

pub(crate) const DEFAULT_PAGE_LIMIT: usize = 50;
pub(crate) const MAX_PAGE_LIMIT: usize = 500;
