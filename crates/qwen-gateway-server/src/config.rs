use std::path::PathBuf;

use qwen_gateway_upstream::RetryPolicy;

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_port: u16,
    pub upstream_base_url: String,
    pub session_timeout_ms: u64,
    pub session_sweep_interval_ms: u64,
    pub upstream_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub models_cache_ttl_ms: u64,
    pub persistence_path: PathBuf,
    pub trust_proxy: bool,
    pub shutdown_drain_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: 3000,
            upstream_base_url: "https://chat.qwen.ai".to_string(),
            session_timeout_ms: 30 * 60 * 1_000,
            session_sweep_interval_ms: 10 * 60 * 1_000,
            upstream_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
            models_cache_ttl_ms: 60 * 60 * 1_000,
            persistence_path: PathBuf::from("qwen-gateway.db"),
            trust_proxy: false,
            shutdown_drain_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayConfig;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_port, 3000);
        assert_eq!(config.session_timeout_ms, 1_800_000);
        assert_eq!(config.session_sweep_interval_ms, 600_000);
        assert_eq!(config.upstream_timeout_ms, 60_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.models_cache_ttl_ms, 3_600_000);
        assert!(!config.trust_proxy);
        assert_eq!(config.shutdown_drain_ms, 10_000);
    }
}
