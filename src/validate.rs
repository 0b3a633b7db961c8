use axum::body::Bytes;
use axum::http::HeaderMap;
use serde::de::DeserializeOwned;

use crate::config::{AuthConfig, Config};
use crate::error::AppError;
use crate::models::MessagesRequest;

/// Authenticates a request against the gateway key. `x-api-key` is the
/// primary scheme; `Authorization: Bearer` is accepted as a fallback for
/// clients that only speak that header.
pub fn authenticate(headers: &HeaderMap, auth: &AuthConfig) -> Result<(), AppError> {
    if let Some(key) = header_str(headers, "x-api-key") {
        if key == auth.api_key {
            return Ok(());
        }
        return Err(AppError::unauthorized("invalid x-api-key"));
    }
    if let Some(value) = header_str(headers, "authorization")
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        if token == auth.api_key {
            return Ok(());
        }
        return Err(AppError::unauthorized("invalid bearer token"));
    }
    Err(AppError::unauthorized(
        "missing x-api-key or Authorization header",
    ))
}

/// The `anthropic-version` header is mandatory on message endpoints.
pub fn require_version(headers: &HeaderMap, auth: &AuthConfig) -> Result<(), AppError> {
    match header_str(headers, "anthropic-version") {
        Some(version) if !version.trim().is_empty() => Ok(()),
        _ => Err(AppError::bad_request(format!(
            "anthropic-version header is required (expected {})",
            auth.anthropic_version
        ))),
    }
}

/// Two-stage body decode. A body that is not JSON at all is a
/// `malformed_payload` (a server-side failure by contract); JSON that
/// does not fit the request shape is an ordinary invalid request.
pub fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::malformed_payload(format!("request body is not JSON: {}", e)))?;
    serde_json::from_value(value)
        .map_err(|e| AppError::bad_request(format!("invalid request body: {}", e)))
}

/// Structural validation plus model resolution. Mutates the request in
/// place (stream cap, model rename) and returns the upstream model name;
/// the caller keeps the original name for response echoing.
pub fn validate_request(req: &mut MessagesRequest, config: &Config) -> Result<String, AppError> {
    if req.model.trim().is_empty() {
        return Err(AppError::bad_request("model must be a non-empty string"));
    }
    if req.max_tokens == 0 {
        return Err(AppError::bad_request("max_tokens must be at least 1"));
    }
    if req.messages.is_empty() {
        return Err(AppError::bad_request("messages must be non-empty"));
    }
    for (i, message) in req.messages.iter().enumerate() {
        match message.role.as_str() {
            "user" | "assistant" | "system" => {}
            other => {
                return Err(AppError::bad_request(format!(
                    "messages[{}].role '{}' is not one of user, assistant, system",
                    i, other
                )));
            }
        }
        if message.content.is_empty() {
            return Err(AppError::bad_request(format!(
                "messages[{}].content must be non-empty",
                i
            )));
        }
    }

    // Streaming responses are capped so a runaway generation cannot hold
    // a connection open indefinitely.
    if req.stream == Some(true) && req.max_tokens > config.limits.stream_max_tokens_cap {
        req.max_tokens = config.limits.stream_max_tokens_cap;
    }

    resolve_model(&req.model, config)
}

fn resolve_model(model: &str, config: &Config) -> Result<String, AppError> {
    let models = &config.models;
    if models.blocklist.contains(model) {
        return Err(AppError::bad_request("model is blocked"));
    }
    if !models.allowlist.is_empty() && !models.allowlist.contains(model) {
        return Err(AppError::bad_request("model not in allowlist"));
    }
    Ok(models
        .model_map
        .get(model)
        .cloned()
        .unwrap_or_else(|| model.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
