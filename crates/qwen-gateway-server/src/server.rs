use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::audit::{
    handle_delete_session, handle_get_request, handle_get_response, handle_get_session,
    handle_list_requests, handle_list_responses, handle_list_sessions, handle_request_response,
    handle_responses_stats, handle_session_requests, handle_session_stats,
};
use crate::completions::handle_chat_completions;
use crate::endpoints::*;
use crate::models::{handle_get_model, handle_list_models};
use crate::state::GatewayState;
use crate::status::{handle_health, handle_metrics};
use crate::sweeper::start_session_sweeper;

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(OPENAI_CHAT_COMPLETIONS_ENDPOINT, post(handle_chat_completions))
        .route(OPENAI_MODELS_ENDPOINT, get(handle_list_models))
        .route(OPENAI_MODEL_DETAIL_ENDPOINT, get(handle_get_model))
        .route(HEALTH_ENDPOINT, get(handle_health))
        .route(METRICS_ENDPOINT, get(handle_metrics))
        .route(SESSIONS_ENDPOINT, get(handle_list_sessions))
        .route(
            SESSION_DETAIL_ENDPOINT,
            get(handle_get_session).delete(handle_delete_session),
        )
        .route(SESSION_STATS_ENDPOINT, get(handle_session_stats))
        .route(SESSION_REQUESTS_ENDPOINT, get(handle_session_requests))
        .route(REQUESTS_ENDPOINT, get(handle_list_requests))
        .route(REQUEST_DETAIL_ENDPOINT, get(handle_get_request))
        .route(REQUEST_RESPONSE_ENDPOINT, get(handle_request_response))
        .route(RESPONSES_ENDPOINT, get(handle_list_responses))
        .route(RESPONSES_STATS_ENDPOINT, get(handle_responses_stats))
        .route(RESPONSE_DETAIL_ENDPOINT, get(handle_get_response))
        .with_state(state)
}

/// Binds, serves, and shuts down in order: stop accepting, drain in-flight
/// requests up to the drain deadline, stop the sweeper, release the store.
pub async fn run_server(state: Arc<GatewayState>) -> Result<()> {
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], state.config.listen_port));
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    tracing::info!(
        addr = %local_addr,
        upstream = %state.config.upstream_base_url,
        db = %state.config.persistence_path.display(),
        "gateway listening"
    );

    let mut sweeper = start_session_sweeper(
        state.store.clone(),
        Duration::from_millis(state.config.session_sweep_interval_ms.max(1)),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let drain_ms = state.config.shutdown_drain_ms;
    let app = build_router(state);
    let mut serve_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    tokio::select! {
        result = &mut serve_task => {
            sweeper.shutdown().await;
            return result
                .context("gateway server task failed")?
                .context("gateway server exited unexpectedly");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown signal received, draining in-flight requests");
        }
    }

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(Duration::from_millis(drain_ms.max(1)), &mut serve_task).await {
        Ok(result) => {
            result
                .context("gateway server task failed")?
                .context("gateway server exited unexpectedly")?;
        }
        Err(_) => {
            tracing::warn!(drain_ms, "drain deadline exceeded, aborting remaining connections");
            serve_task.abort();
        }
    }

    sweeper.shutdown().await;
    tracing::info!("gateway stopped");
    Ok(())
}
