mod cli_args;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use qwen_gateway_server::{
    install_metrics_recorder, run_server, GatewayConfig, GatewayState,
};
use qwen_gateway_store::GatewayStore;
use qwen_gateway_upstream::{QwenClient, QwenClientConfig, RetryPolicy, UpstreamCredentials};

use crate::cli_args::Cli;

fn init_tracing(log_level: &str) {
    let default_level = match log_level.trim().to_ascii_lowercase().as_str() {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        _ => LevelFilter::INFO,
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let credentials = UpstreamCredentials::new(cli.upstream_token, cli.upstream_cookie)
        .context("upstream credentials are invalid")?;
    tracing::info!(
        token = %credentials.token_preview(),
        cookie = %credentials.cookie_preview(),
        "loaded upstream credentials"
    );

    let config = GatewayConfig {
        listen_port: cli.port,
        upstream_base_url: cli.upstream_base_url,
        session_timeout_ms: cli.session_timeout_ms,
        session_sweep_interval_ms: cli.session_sweep_interval_ms,
        upstream_timeout_ms: cli.upstream_timeout_ms,
        retry: RetryPolicy {
            max_attempts: cli.retry_max_attempts,
            initial_delay_ms: cli.retry_initial_delay_ms,
            max_delay_ms: cli.retry_max_delay_ms,
            multiplier: cli.retry_multiplier,
        },
        models_cache_ttl_ms: cli.models_cache_ttl_ms,
        persistence_path: cli.db_path,
        trust_proxy: cli.trust_proxy,
        ..GatewayConfig::default()
    };

    let store = GatewayStore::open(&config.persistence_path, config.session_timeout_ms)
        .with_context(|| {
            format!(
                "failed to open gateway database at {}",
                config.persistence_path.display()
            )
        })?;
    let upstream = QwenClient::new(
        &credentials,
        QwenClientConfig {
            base_url: config.upstream_base_url.clone(),
            request_timeout_ms: config.upstream_timeout_ms,
            retry: config.retry,
        },
    )
    .context("failed to build upstream client")?;
    let metrics = install_metrics_recorder().context("failed to install metrics recorder")?;

    let state = Arc::new(GatewayState::new(
        config,
        credentials,
        upstream,
        store,
        Some(metrics),
    ));
    run_server(state).await
}
