use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use qwen_gateway_core::{current_unix_timestamp, current_unix_timestamp_ms};
use qwen_gateway_upstream::{ModelEntry, QwenClient, UpstreamError};

use crate::error::ApiError;
use crate::state::GatewayState;

const MODEL_OWNER: &str = "qwen";

#[derive(Debug, Clone)]
struct ModelsSnapshot {
    fetched_at_ms: u64,
    models: Vec<Value>,
}

/// Lazy TTL-bounded snapshot of the upstream model list. The lock covers
/// the refresh, so a cache miss fires exactly one upstream call no matter
/// how many readers arrive at once.
pub struct ModelsCache {
    ttl_ms: u64,
    inner: Mutex<Option<ModelsSnapshot>>,
}

impl ModelsCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            inner: Mutex::new(None),
        }
    }

    pub async fn get(&self, upstream: &QwenClient) -> Result<Vec<Value>, UpstreamError> {
        let mut guard = self.inner.lock().await;
        let now_ms = current_unix_timestamp_ms();
        if let Some(snapshot) = guard.as_ref() {
            if now_ms.saturating_sub(snapshot.fetched_at_ms) < self.ttl_ms {
                return Ok(snapshot.models.clone());
            }
        }
        let entries = upstream.list_models().await?;
        let created = current_unix_timestamp();
        let models: Vec<Value> = entries
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| reshape_model(entry, created))
            .collect();
        tracing::debug!(count = models.len(), "refreshed model snapshot");
        *guard = Some(ModelsSnapshot {
            fetched_at_ms: now_ms,
            models: models.clone(),
        });
        Ok(models)
    }
}

/// Reshapes a native upstream entry into the OpenAI model object, keeping
/// capability flags and context lengths under `metadata`.
fn reshape_model(entry: &ModelEntry, created: u64) -> Value {
    json!({
        "id": entry.id,
        "object": "model",
        "created": created,
        "owned_by": MODEL_OWNER,
        "permission": [],
        "root": entry.id,
        "parent": null,
        "metadata": {
            "display_name": entry.display_name(),
            "description": entry.info.meta.description,
            "capabilities": entry.info.meta.capabilities,
            "max_context_length": entry.info.meta.max_context_length,
            "max_generation_length": entry.info.meta.max_generation_length,
            "chat_types": entry.info.meta.chat_type,
        },
    })
}

pub(crate) async fn handle_list_models(State(state): State<Arc<GatewayState>>) -> Response {
    match state.models.get(&state.upstream).await {
        Ok(models) => Json(json!({"object": "list", "data": models})).into_response(),
        Err(error) => ApiError::from_upstream(&error).into_response(),
    }
}

pub(crate) async fn handle_get_model(
    State(state): State<Arc<GatewayState>>,
    AxumPath(model_id): AxumPath<String>,
) -> Response {
    let models = match state.models.get(&state.upstream).await {
        Ok(models) => models,
        Err(error) => return ApiError::from_upstream(&error).into_response(),
    };
    match models
        .into_iter()
        .find(|model| model.get("id").and_then(Value::as_str) == Some(model_id.as_str()))
    {
        Some(model) => Json(model).into_response(),
        None => ApiError::not_found("model_not_found", format!("model '{model_id}' is unknown"))
            .into_response(),
    }
}
