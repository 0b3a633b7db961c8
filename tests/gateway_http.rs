use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use axum::response::IntoResponse;
use axum::{Json, Router, routing::post};
use serde_json::{Value, json};

use messages_gateway::config::{
    AuthConfig, Config, LimitsConfig, ModelsConfig, ObservabilityConfig, ServerConfig,
    UpstreamConfig,
};
use messages_gateway::quota::QuotaLedger;
use messages_gateway::state::AppState;
use messages_gateway::telemetry::init_metrics_noop;

const GATEWAY_KEY: &str = "secret-key";

struct Harness {
    base: String,
    upstream_hits: Arc<AtomicUsize>,
    quota: Arc<QuotaLedger>,
    client: reqwest::Client,
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn messages(&self) -> reqwest::RequestBuilder {
        self.client
            .post(self.url("/v1/messages"))
            .header("x-api-key", GATEWAY_KEY)
            .header("anthropic-version", "2023-06-01")
    }
}

async fn mock_upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(body): Json<Value>| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                if body["stream"] == json!(true) && body["model"] == json!("drop-mid-stream") {
                    // A connection that dies mid-generation: some text,
                    // no finish_reason, no [DONE].
                    let frames = concat!(
                        "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-x\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
                        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
                    );
                    axum::response::Response::builder()
                        .header("content-type", "text/event-stream")
                        .body(axum::body::Body::from(frames))
                        .expect("sse response")
                } else if body["stream"] == json!(true) {
                    let frames = concat!(
                        "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-x\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
                        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
                        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\n",
                        "data: [DONE]\n\n",
                    );
                    axum::response::Response::builder()
                        .header("content-type", "text/event-stream")
                        .body(axum::body::Body::from(frames))
                        .expect("sse response")
                } else {
                    Json(json!({
                        "id": "chatcmpl-1",
                        "model": "gpt-x",
                        "choices": [{
                            "index": 0,
                            "message": {"role": "assistant", "content": "Hello there"},
                            "finish_reason": "stop"
                        }],
                        "usage": {"prompt_tokens": 9, "completion_tokens": 3}
                    }))
                    .into_response()
                }
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    addr
}

async fn start_gateway(adjust: impl FnOnce(&mut Config)) -> Harness {
    let upstream_hits = Arc::new(AtomicUsize::new(0));
    let upstream_addr = mock_upstream(upstream_hits.clone()).await;

    let mut config = Config {
        server: ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        },
        auth: AuthConfig {
            api_key: GATEWAY_KEY.to_string(),
            anthropic_version: "2023-06-01".to_string(),
        },
        upstream: UpstreamConfig {
            base_url: format!("http://{}", upstream_addr),
            api_key: "upstream-key".to_string(),
            connect_timeout_ms: 1000,
            read_timeout_ms: 5000,
            stream_idle_timeout_ms: 2000,
            pool_max_idle_per_host: 4,
        },
        models: ModelsConfig::default(),
        limits: LimitsConfig::default(),
        observability: ObservabilityConfig::default(),
    };
    adjust(&mut config);

    let inflight_count = Arc::new(AtomicU64::new(0));
    let metrics = init_metrics_noop(inflight_count.clone());
    let state = AppState::new(config, metrics, inflight_count).expect("state");
    let quota = state.quota.clone();
    let app = messages_gateway::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("gateway addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve gateway");
    });

    Harness {
        base: format!("http://{}", addr),
        upstream_hits,
        quota,
        client: reqwest::Client::new(),
    }
}

fn simple_body() -> Value {
    json!({
        "model": "claude-sonnet",
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[tokio::test]
async fn rejects_missing_credentials_before_touching_the_upstream() {
    let h = start_gateway(|_| {}).await;
    let resp = h
        .client
        .post(h.url("/v1/messages"))
        .header("anthropic-version", "2023-06-01")
        .json(&simple_body())
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn requires_the_version_header() {
    let h = start_gateway(|_| {}).await;
    let resp = h
        .client
        .post(h.url("/v1/messages"))
        .header("x-api-key", GATEWAY_KEY)
        .json(&simple_body())
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn completes_a_unary_request() {
    let h = start_gateway(|c| {
        c.models
            .model_map
            .insert("claude-sonnet".to_string(), "gpt-x".to_string());
    })
    .await;
    let resp = h
        .messages()
        .json(&simple_body())
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    // The gateway echoes the requested model, not the upstream one.
    assert_eq!(body["model"], "claude-sonnet");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "Hello there");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 9);
    assert_eq!(body["usage"]["output_tokens"], 3);
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn accepts_a_bearer_token_as_fallback() {
    let h = start_gateway(|_| {}).await;
    let resp = h
        .client
        .post(h.url("/v1/messages"))
        .header("Authorization", format!("Bearer {}", GATEWAY_KEY))
        .header("Anthropic-Version", "2023-06-01")
        .json(&simple_body())
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn counts_tokens_locally_even_for_large_bodies() {
    let h = start_gateway(|_| {}).await;
    let big = "lorem ipsum ".repeat(150_000);
    // Only the version header; the estimate needs no credential.
    let resp = h
        .client
        .post(h.url("/v1/messages/count_tokens"))
        .header("anthropic-version", "2023-06-01")
        .json(&json!({
            "model": "claude-sonnet",
            "messages": [{"role": "user", "content": big}]
        }))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "token_count");
    let tokens = body["input_tokens"].as_u64().expect("numeric");
    assert!(tokens > 400_000, "estimate {} too small", tokens);
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejects_an_unknown_tool_choice() {
    let h = start_gateway(|_| {}).await;
    let mut body = simple_body();
    body["tools"] = json!([{"name": "lookup", "input_schema": {"type": "object"}}]);
    body["tool_choice"] = json!({"type": "tool", "name": "missing"});
    let resp = h.messages().json(&body).send().await.expect("send");
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unparsable_bodies_surface_as_server_errors() {
    let h = start_gateway(|_| {}).await;
    let resp = h
        .client
        .post(h.url("/v1/messages"))
        .header("x-api-key", GATEWAY_KEY)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "api_error");
}

#[tokio::test]
async fn oversized_conversations_fail_without_an_upstream_call() {
    let h = start_gateway(|c| {
        c.limits.context_window_tokens = 50;
    })
    .await;
    let mut body = simple_body();
    body["messages"] = json!([{"role": "user", "content": "x".repeat(10_000)}]);
    let resp = h.messages().json(&body).send().await.expect("send");
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn quota_exhaustion_is_explicit_and_reset_restores_service() {
    let h = start_gateway(|c| {
        c.limits.max_calls_per_batch = 2;
        // A window long enough that the handler never resets on its own.
        c.limits.batch_window_secs = 3600;
    })
    .await;

    for _ in 0..2 {
        let resp = h
            .messages()
            .json(&simple_body())
            .send()
            .await
            .expect("send");
        assert_eq!(resp.status(), 200);
    }
    let resp = h
        .messages()
        .json(&simple_body())
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 2);
    assert_eq!(h.quota.usage().batch_calls, 2);

    let resp = h
        .client
        .post(h.url("/admin/quota/reset"))
        .header("x-api-key", GATEWAY_KEY)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["previous_batch_calls"], 2);

    let resp = h
        .messages()
        .json(&simple_body())
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
    // Lifetime total keeps counting across the reset.
    assert_eq!(h.quota.usage().total_calls, 3);
}

#[tokio::test]
async fn streams_well_ordered_sse_events() {
    let h = start_gateway(|_| {}).await;
    let mut body = simple_body();
    body["stream"] = json!(true);
    let resp = h.messages().json(&body).send().await.expect("send");
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let text = resp.text().await.expect("body");
    let events: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| {
            f.lines()
                .next()
                .and_then(|l| l.strip_prefix("event: "))
                .expect("event line")
        })
        .collect();
    assert_eq!(
        events,
        [
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop"
        ]
    );

    let message_delta = text
        .split("\n\n")
        .find(|f| f.starts_with("event: message_delta"))
        .and_then(|f| f.lines().find_map(|l| l.strip_prefix("data: ")))
        .expect("message_delta data");
    let delta: Value = serde_json::from_str(message_delta).expect("json");
    assert_eq!(delta["delta"]["stop_reason"], "end_turn");
    assert_eq!(delta["usage"]["output_tokens"], 2);
    assert_eq!(delta["usage"]["input_tokens"], 9);

    let texts: String = text
        .split("\n\n")
        .filter(|f| f.starts_with("event: content_block_delta"))
        .filter_map(|f| f.lines().find_map(|l| l.strip_prefix("data: ")))
        .map(|d| {
            let v: Value = serde_json::from_str(d).expect("json");
            v["delta"]["text"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(texts, "Hello");
}

#[tokio::test]
async fn a_truncated_upstream_stream_ends_in_an_error_event() {
    let h = start_gateway(|_| {}).await;
    let mut body = simple_body();
    body["model"] = json!("drop-mid-stream");
    body["stream"] = json!(true);
    let resp = h.messages().json(&body).send().await.expect("send");
    assert_eq!(resp.status(), 200);

    let text = resp.text().await.expect("body");
    let events: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| {
            f.lines()
                .next()
                .and_then(|l| l.strip_prefix("event: "))
                .expect("event line")
        })
        .collect();
    // The partial text went out, but the stream must not pretend the
    // message completed.
    assert_eq!(events.last(), Some(&"error"));
    assert!(!events.contains(&"message_stop"));

    let error = text
        .split("\n\n")
        .find(|f| f.starts_with("event: error"))
        .and_then(|f| f.lines().find_map(|l| l.strip_prefix("data: ")))
        .expect("error data");
    let error: Value = serde_json::from_str(error).expect("json");
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"]["type"], "api_error");
}

#[tokio::test]
async fn serves_the_configured_model_catalog() {
    let h = start_gateway(|c| {
        c.models.catalog = vec![messages_gateway::models::ModelInfo {
            id: "claude-sonnet".to_string(),
            model_type: "model".to_string(),
            display_name: "Claude Sonnet".to_string(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
        }];
    })
    .await;
    // No headers at all; the catalog is public.
    let resp = h.client.get(h.url("/v1/models")).send().await.expect("send");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["data"][0]["id"], "claude-sonnet");
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn health_reports_quota_usage() {
    let h = start_gateway(|_| {}).await;
    let resp = h
        .client
        .get(h.url("/health"))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["quota"]["batch_calls"], 0);
}
