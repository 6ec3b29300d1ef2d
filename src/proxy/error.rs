//! Proxy error taxonomy and response mapping
//!
//! Components raise typed errors locally; this is where they become HTTP.
//! Internal details are logged, never echoed; upstream credentials never
//! appear in any response body.

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

use crate::limiter::DenyReason;
use crate::pool::pipeline::PipelineError;
use crate::pool::PoolError;
use crate::store::StoreError;
use crate::tenant::{millis_to_rfc3339, FieldError};

/// Everything that can go wrong while handling one request.
#[derive(Debug)]
pub enum ProxyError {
    /// No credential presented.
    Unauthenticated,
    /// Credential not found in the tenant store.
    InvalidCredential,
    /// Tenant past its expiry date.
    KeyExpired,
    /// Quota exhausted for the current window.
    RateLimited {
        tokens_used: u64,
        tokens_limit: u64,
        window_ends_at: i64,
        retry_after_seconds: u64,
    },
    /// Malformed admin payload.
    Validation(Vec<FieldError>),
    NotFound,
    Conflict,
    /// Pipelining queue full.
    Backpressure,
    AcquireTimeout,
    QueueTimeout,
    /// Network/TLS/timeout trouble talking to the upstream.
    Upstream(String),
    /// Missing upstream credential or similar misconfiguration.
    Configuration(String),
    /// Failed to read the inbound request body.
    BodyRead(String),
    /// Anything else. Details are logged, not echoed.
    Internal(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, retry_after, body) = match &self {
            ProxyError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                None,
                json!({"error": "unauthenticated", "message": "missing API key"}),
            ),
            ProxyError::InvalidCredential => (
                StatusCode::UNAUTHORIZED,
                None,
                json!({"error": "invalid_credential", "message": "unknown API key"}),
            ),
            ProxyError::KeyExpired => (
                StatusCode::FORBIDDEN,
                None,
                json!({"error": "key_expired", "message": "API key has expired"}),
            ),
            ProxyError::RateLimited {
                tokens_used,
                tokens_limit,
                window_ends_at,
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                Some(*retry_after_seconds),
                json!({
                    "message": format!(
                        "rate limit exceeded: {} of {} tokens used in the current window",
                        tokens_used, tokens_limit
                    ),
                    "type": "rate_limit_exceeded",
                    "tokens_used": tokens_used,
                    "tokens_limit": tokens_limit,
                    "window_ends_at": millis_to_rfc3339(*window_ends_at),
                }),
            ),
            ProxyError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                None,
                json!({"error": "validation", "details": details}),
            ),
            ProxyError::NotFound => (
                StatusCode::NOT_FOUND,
                None,
                json!({"error": "not_found", "message": "no such key"}),
            ),
            ProxyError::Conflict => (
                StatusCode::CONFLICT,
                None,
                json!({"error": "conflict", "message": "key already exists"}),
            ),
            ProxyError::Backpressure => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(1),
                json!({"error": "backpressure", "message": "request queue is full, retry shortly"}),
            ),
            ProxyError::AcquireTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                None,
                json!({"error": "acquire_timeout", "message": "no upstream connection became available"}),
            ),
            ProxyError::QueueTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                None,
                json!({"error": "queue_timeout", "message": "request timed out waiting for dispatch"}),
            ),
            ProxyError::Upstream(msg) => (
                StatusCode::BAD_GATEWAY,
                None,
                json!({"error": "upstream_error", "message": msg}),
            ),
            ProxyError::Configuration(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                json!({"error": "configuration_error", "message": msg}),
            ),
            ProxyError::BodyRead(msg) => (
                StatusCode::BAD_REQUEST,
                None,
                json!({"error": "bad_request", "message": msg}),
            ),
            ProxyError::Internal(msg) => {
                tracing::error!(error = %msg, "internal proxy error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    json!({"error": "internal", "message": "internal server error"}),
                )
            }
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error = ?self, "request failed");
        } else {
            tracing::debug!(status = %status, error = ?self, "request rejected");
        }

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(seconds) = retry_after {
            builder = builder.header(header::RETRY_AFTER, seconds.to_string());
        }
        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}

impl From<DenyReason> for ProxyError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::KeyExpired => ProxyError::KeyExpired,
            DenyReason::LimitExceeded {
                tokens_used,
                tokens_limit,
                window_ends_at,
                retry_after_seconds,
            } => ProxyError::RateLimited {
                tokens_used,
                tokens_limit,
                window_ends_at,
                retry_after_seconds,
            },
            DenyReason::Internal(msg) => ProxyError::Internal(msg),
        }
    }
}

impl From<StoreError> for ProxyError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict => ProxyError::Conflict,
            StoreError::NotFound => ProxyError::NotFound,
            StoreError::Validation(details) => ProxyError::Validation(details),
            StoreError::Backend(msg) => ProxyError::Internal(msg),
        }
    }
}

impl From<PoolError> for ProxyError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::AcquireTimeout => ProxyError::AcquireTimeout,
            PoolError::Closed => ProxyError::Internal("connection pool is shut down".into()),
            PoolError::Build(msg) => ProxyError::Internal(msg),
        }
    }
}

impl From<PipelineError> for ProxyError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Backpressure => ProxyError::Backpressure,
            PipelineError::QueueTimeout => ProxyError::QueueTimeout,
            PipelineError::ShuttingDown => {
                ProxyError::Internal("proxy is shutting down".into())
            }
        }
    }
}
