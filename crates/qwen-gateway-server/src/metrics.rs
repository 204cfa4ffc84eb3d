use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub(crate) const REQUESTS_TOTAL: &str = "qwen_gateway_requests_total";
pub(crate) const COMPLETIONS_TOTAL: &str = "qwen_gateway_completions_total";
pub(crate) const UPSTREAM_ERRORS_TOTAL: &str = "qwen_gateway_upstream_errors_total";
pub(crate) const STREAM_DISCONNECTS_TOTAL: &str = "qwen_gateway_stream_disconnects_total";
pub(crate) const SESSIONS_SWEPT_TOTAL: &str = "qwen_gateway_sessions_swept_total";
pub(crate) const REQUEST_DURATION_SECONDS: &str = "qwen_gateway_request_duration_seconds";

/// Installs the process-wide Prometheus recorder and registers the counter
/// set. Call once from the composition root; the returned handle renders
/// the exposition text for `GET /metrics`.
pub fn install_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_counter!(
        REQUESTS_TOTAL,
        "Chat completion requests accepted, labeled by mode"
    );
    describe_counter!(
        COMPLETIONS_TOTAL,
        "Chat completion turns finished, labeled by outcome"
    );
    describe_counter!(
        UPSTREAM_ERRORS_TOTAL,
        "Upstream call failures, labeled by kind"
    );
    describe_counter!(
        STREAM_DISCONNECTS_TOTAL,
        "Streaming requests abandoned by the client mid-reply"
    );
    describe_counter!(
        SESSIONS_SWEPT_TOTAL,
        "Expired sessions removed by the sweeper"
    );
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        "Wall-clock duration of completed chat turns"
    );
    Ok(handle)
}

pub(crate) fn upstream_error_kind(error: &qwen_gateway_upstream::UpstreamError) -> &'static str {
    use qwen_gateway_upstream::UpstreamError;
    match error {
        UpstreamError::Transient(_) => "transient",
        UpstreamError::UpstreamStatus { .. } => "upstream_status",
        UpstreamError::AuthChallenge => "auth_challenge",
        UpstreamError::InvalidParent(_) => "invalid_parent",
        UpstreamError::SemanticError(_) => "semantic",
        UpstreamError::Timeout(_) => "timeout",
        UpstreamError::Serde(_) | UpstreamError::InvalidResponse(_) => "protocol",
    }
}
