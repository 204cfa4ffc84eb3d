use metrics_exporter_prometheus::PrometheusHandle;

use qwen_gateway_store::GatewayStore;
use qwen_gateway_upstream::{QwenClient, UpstreamCredentials};

use crate::config::GatewayConfig;
use crate::models::ModelsCache;

/// Shared per-process state handed to every handler.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub credentials: UpstreamCredentials,
    pub upstream: QwenClient,
    pub store: GatewayStore,
    pub models: ModelsCache,
    pub metrics: Option<PrometheusHandle>,
    pub started_at_ms: u64,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        credentials: UpstreamCredentials,
        upstream: QwenClient,
        store: GatewayStore,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let models = ModelsCache::new(config.models_cache_ttl_ms);
        Self {
            config,
            credentials,
            upstream,
            store,
            models,
            metrics,
            started_at_ms: qwen_gateway_core::current_unix_timestamp_ms(),
        }
    }
}
