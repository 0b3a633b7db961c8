use axum::{Json, http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::models::{ErrorBody, ErrorResponse};

/// Gateway error taxonomy. Every failure that leaves a handler is one of
/// these kinds; raw upstream errors are re-classified in `provider` and
/// never cross that boundary unclassified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    BadRequest,
    MalformedPayload,
    ContextTooLarge,
    UnmatchedToolResult,
    UnsupportedFeature,
    UpstreamProtocol,
    UpstreamTimeout,
    QuotaExceeded,
    ServiceFailure,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::BadRequest
            | ErrorKind::ContextTooLarge
            | ErrorKind::UnmatchedToolResult
            | ErrorKind::UnsupportedFeature => StatusCode::BAD_REQUEST,
            // Unparsable bodies surface as a server-side failure, not a
            // 400. Deliberate; flipping this changes the public contract.
            ErrorKind::MalformedPayload => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::UpstreamProtocol => StatusCode::BAD_GATEWAY,
            ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ServiceFailure => StatusCode::BAD_GATEWAY,
        }
    }

    /// `error.type` value in the Anthropic error envelope.
    pub fn wire_type(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "authentication_error",
            ErrorKind::BadRequest
            | ErrorKind::ContextTooLarge
            | ErrorKind::UnmatchedToolResult
            | ErrorKind::UnsupportedFeature => "invalid_request_error",
            ErrorKind::QuotaExceeded => "rate_limit_error",
            ErrorKind::MalformedPayload
            | ErrorKind::UpstreamProtocol
            | ErrorKind::UpstreamTimeout
            | ErrorKind::ServiceFailure => "api_error",
        }
    }

    /// Stable label for metrics attributes.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::MalformedPayload => "malformed_payload",
            ErrorKind::ContextTooLarge => "context_too_large",
            ErrorKind::UnmatchedToolResult => "unmatched_tool_result",
            ErrorKind::UnsupportedFeature => "unsupported_feature",
            ErrorKind::UpstreamProtocol => "upstream_protocol",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::ServiceFailure => "service_failure",
        }
    }
}

#[derive(Debug, Error)]
#[error("{}: {}", .kind.label(), .message)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn malformed_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedPayload, message)
    }

    pub fn context_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContextTooLarge, message)
    }

    pub fn unmatched_tool_result(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnmatchedToolResult, message)
    }

    pub fn unsupported_feature(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFeature, message)
    }

    pub fn upstream_protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamProtocol, message)
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTimeout, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn service_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceFailure, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorResponse {
            response_type: "error".to_string(),
            error: ErrorBody {
                error_type: self.kind.wire_type().to_string(),
                message: self.message,
            },
        };
        (self.kind.status(), Json(body)).into_response()
    }
}

/// Classifies a non-2xx upstream status. Timeouts and transport failures
/// are handled separately at the call site.
pub fn map_upstream_status(status: reqwest::StatusCode, body: &str) -> AppError {
    let message = if body.is_empty() {
        format!("upstream error: {}", status)
    } else {
        format!("upstream error: {} {}", status, body)
    };
    AppError::service_failure(message)
}
