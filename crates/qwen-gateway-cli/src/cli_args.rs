use std::path::PathBuf;

use clap::Parser;

/// OpenAI-compatible gateway in front of the Qwen chat service.
#[derive(Debug, Parser)]
#[command(name = "qwen-gateway", version)]
pub struct Cli {
    /// Upstream anti-bot token (required).
    #[arg(long = "upstream-token", env = "QWEN_GATEWAY_UPSTREAM_TOKEN")]
    pub upstream_token: String,

    /// Upstream cookie blob (required).
    #[arg(long = "upstream-cookie", env = "QWEN_GATEWAY_UPSTREAM_COOKIE")]
    pub upstream_cookie: String,

    /// Upstream base URL.
    #[arg(
        long = "upstream-base-url",
        env = "QWEN_GATEWAY_UPSTREAM_BASE_URL",
        default_value = "https://chat.qwen.ai"
    )]
    pub upstream_base_url: String,

    /// Port to listen on.
    #[arg(long = "port", env = "QWEN_GATEWAY_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Session inactivity timeout in milliseconds.
    #[arg(
        long = "session-timeout-ms",
        env = "QWEN_GATEWAY_SESSION_TIMEOUT_MS",
        default_value_t = 1_800_000
    )]
    pub session_timeout_ms: u64,

    /// Expired-session sweep cadence in milliseconds.
    #[arg(
        long = "session-sweep-interval-ms",
        env = "QWEN_GATEWAY_SESSION_SWEEP_INTERVAL_MS",
        default_value_t = 600_000
    )]
    pub session_sweep_interval_ms: u64,

    /// Per-call upstream network timeout in milliseconds.
    #[arg(
        long = "upstream-timeout-ms",
        env = "QWEN_GATEWAY_UPSTREAM_TIMEOUT_MS",
        default_value_t = 60_000
    )]
    pub upstream_timeout_ms: u64,

    /// Maximum upstream attempts per call, first try included.
    #[arg(
        long = "retry-max-attempts",
        env = "QWEN_GATEWAY_RETRY_MAX_ATTEMPTS",
        default_value_t = 3
    )]
    pub retry_max_attempts: usize,

    /// Initial retry backoff in milliseconds.
    #[arg(
        long = "retry-initial-delay-ms",
        env = "QWEN_GATEWAY_RETRY_INITIAL_DELAY_MS",
        default_value_t = 1_000
    )]
    pub retry_initial_delay_ms: u64,

    /// Retry backoff cap in milliseconds.
    #[arg(
        long = "retry-max-delay-ms",
        env = "QWEN_GATEWAY_RETRY_MAX_DELAY_MS",
        default_value_t = 10_000
    )]
    pub retry_max_delay_ms: u64,

    /// Retry backoff multiplier.
    #[arg(
        long = "retry-multiplier",
        env = "QWEN_GATEWAY_RETRY_MULTIPLIER",
        default_value_t = 2
    )]
    pub retry_multiplier: u64,

    /// Model list cache lifetime in milliseconds.
    #[arg(
        long = "models-cache-ttl-ms",
        env = "QWEN_GATEWAY_MODELS_CACHE_TTL_MS",
        default_value_t = 3_600_000
    )]
    pub models_cache_ttl_ms: u64,

    /// Embedded database location.
    #[arg(
        long = "db-path",
        env = "QWEN_GATEWAY_DB_PATH",
        default_value = "qwen-gateway.db"
    )]
    pub db_path: PathBuf,

    /// Honour X-Forwarded-* headers from a fronting proxy.
    #[arg(long = "trust-proxy", env = "QWEN_GATEWAY_TRUST_PROXY", default_value_t = false)]
    pub trust_proxy: bool,

    /// Log level: error, warn, info, or debug.
    #[arg(long = "log-level", env = "QWEN_GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
