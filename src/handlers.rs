use axum::body::Bytes;
use axum::{Json, extract::State, http::HeaderMap, response::IntoResponse};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{Span, Tracer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::context;
use crate::error::AppError;
use crate::models::{CountTokensRequest, MessagesRequest, ModelsResponse, TokenCountResponse};
use crate::state::{AppState, InflightGuard};
use crate::streaming::stream_response;
use crate::tools::{pair_tool_results, resolve_tool_choice};
use crate::translate;
use crate::validate::{authenticate, parse_body, require_version, validate_request};

pub async fn post_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    let request_id = next_request_id();
    let start = Instant::now();

    authenticate(&headers, &state.config.auth)
        .map_err(|e| fail(&state, &request_id, "-", start, e))?;
    require_version(&headers, &state.config.auth)
        .map_err(|e| fail(&state, &request_id, "-", start, e))?;
    let mut payload: MessagesRequest =
        parse_body(&body).map_err(|e| fail(&state, &request_id, "-", start, e))?;

    let requested_model = payload.model.clone();
    let upstream_model = validate_request(&mut payload, &state.config)
        .map_err(|e| fail(&state, &request_id, &requested_model, start, e))?;
    if let Some(choice) = &payload.tool_choice {
        resolve_tool_choice(choice, payload.tools.as_deref())
            .map_err(|e| fail(&state, &request_id, &requested_model, start, e))?;
    }

    let ctx = context::assemble(&payload, state.config.limits.context_window_tokens)
        .map_err(|e| fail(&state, &request_id, &requested_model, start, e))?;
    if ctx.evicted_messages > 0 {
        info!(
            request_id = %request_id,
            evicted = ctx.evicted_messages,
            estimated_tokens = ctx.estimated_tokens,
            "context truncated"
        );
    }
    pair_tool_results(&ctx.messages)
        .map_err(|e| fail(&state, &request_id, &requested_model, start, e))?;

    let stream = payload.stream == Some(true);
    let upstream_req = translate::to_upstream(&payload, &ctx.messages, upstream_model, stream)
        .map_err(|e| fail(&state, &request_id, &requested_model, start, e))?;

    let inflight = match state.inflight.clone().try_acquire_owned() {
        Ok(p) => InflightGuard::new(p, state.inflight_count.clone()),
        Err(_) => {
            let err = AppError::quota_exceeded("too many in-flight requests");
            return Err(fail(&state, &request_id, &requested_model, start, err));
        }
    };

    // Batch resets are explicit and time-triggered here; admission itself
    // never resets, and a failed upstream call is still a spent admission.
    if state.quota.batch_expired() {
        let previous = state.quota.reset_batch();
        info!(previous_batch_calls = previous, "batch window elapsed, quota reset");
    }
    let quota = match state.quota.try_admit() {
        Ok(usage) => usage,
        Err(usage) => {
            state.metrics.quota_rejections.add(1, &[]);
            let err = AppError::quota_exceeded(format!(
                "upstream call quota exhausted ({}/{} calls this batch)",
                usage.batch_calls, usage.max_per_batch
            ));
            return Err(fail(&state, &request_id, &requested_model, start, err));
        }
    };
    state.metrics.upstream_calls.add(1, &[]);
    state.metrics.requests.add(
        1,
        &[KeyValue::new("stream", if stream { "true" } else { "false" })],
    );

    let mut span = start_trace_span(&request_id, &requested_model, stream);

    if stream {
        let upstream = state
            .upstream
            .open_stream(&upstream_req)
            .await
            .map_err(|e| fail(&state, &request_id, &requested_model, start, e))?;
        state.metrics.latency_ms.record(
            start.elapsed().as_millis() as f64,
            &[KeyValue::new("stream", "true")],
        );
        info!(
            request_id = %request_id,
            model = %requested_model,
            quota_used = quota.batch_calls,
            "stream request accepted"
        );
        span.end();
        return Ok(stream_response(
            upstream,
            requested_model,
            state.config.stream_idle_timeout(),
            inflight,
        ));
    }

    let upstream_resp = state
        .upstream
        .complete(&upstream_req)
        .await
        .map_err(|e| fail(&state, &request_id, &requested_model, start, e))?;
    let message = translate::from_upstream(upstream_resp, &requested_model)
        .map_err(|e| fail(&state, &request_id, &requested_model, start, e))?;
    drop(inflight);

    state.metrics.latency_ms.record(
        start.elapsed().as_millis() as f64,
        &[KeyValue::new("stream", "false")],
    );
    info!(
        request_id = %request_id,
        model = %requested_model,
        latency_ms = start.elapsed().as_millis(),
        quota_used = quota.batch_calls,
        stop_reason = %message.stop_reason,
        status = 200,
        "request completed"
    );
    span.set_attribute(KeyValue::new(
        "output_tokens",
        i64::from(message.usage.output_tokens),
    ));
    span.end();
    Ok(Json(message).into_response())
}

/// Deterministic, upstream-free token estimate for a prospective request.
/// No credential required; nothing here reaches the upstream.
pub async fn post_count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TokenCountResponse>, AppError> {
    require_version(&headers, &state.config.auth)?;
    let payload: CountTokensRequest = parse_body(&body)?;
    if payload.model.trim().is_empty() {
        return Err(AppError::bad_request("model must be a non-empty string"));
    }
    if payload.messages.is_empty() {
        return Err(AppError::bad_request("messages must be non-empty"));
    }
    let input_tokens = context::estimate_input_tokens(
        payload.system.as_ref(),
        &payload.messages,
        payload.tools.as_deref(),
    );
    Ok(Json(TokenCountResponse {
        response_type: "token_count",
        input_tokens,
    }))
}

/// Static catalog; the upstream is never consulted for model listings
/// and no credential is required to read it.
pub async fn get_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        data: state.config.models.catalog.clone(),
    })
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let usage = state.quota.usage();
    Json(serde_json::json!({
        "status": "ok",
        "quota": {
            "batch_calls": usage.batch_calls,
            "max_per_batch": usage.max_per_batch,
            "remaining": usage.remaining(),
            "total_calls": usage.total_calls,
        }
    }))
}

/// Operator-triggered batch reset. Returns what the previous batch spent.
pub async fn post_quota_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    authenticate(&headers, &state.config.auth)?;
    let previous = state.quota.reset_batch();
    info!(previous_batch_calls = previous, "quota reset by operator");
    let usage = state.quota.usage();
    Ok(Json(serde_json::json!({
        "previous_batch_calls": previous,
        "quota": {
            "batch_calls": usage.batch_calls,
            "max_per_batch": usage.max_per_batch,
            "remaining": usage.remaining(),
            "total_calls": usage.total_calls,
        }
    }))
    .into_response())
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("req-{}-{}", ts, seq)
}

fn fail(state: &AppState, request_id: &str, model: &str, start: Instant, err: AppError) -> AppError {
    state
        .metrics
        .errors
        .add(1, &[KeyValue::new("type", err.kind.label())]);
    info!(
        request_id = %request_id,
        model = %model,
        latency_ms = start.elapsed().as_millis(),
        status = err.kind.status().as_u16(),
        error_type = err.kind.label(),
        "request failed"
    );
    err
}

fn start_trace_span(request_id: &str, model: &str, stream: bool) -> global::BoxedSpan {
    let tracer = global::tracer("messages-gateway");
    let mut span = tracer.start("gateway.request");
    span.set_attribute(KeyValue::new("request.id", request_id.to_string()));
    span.set_attribute(KeyValue::new("model", model.to_string()));
    span.set_attribute(KeyValue::new("stream", stream));
    span
}
