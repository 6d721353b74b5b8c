//! Unified HTTP error type for axum request handlers.
//!
//! [`AppError`] carries an [`ErrorKind`] so the breaker/queue/router logic can
//! branch on error *class*, not just a rendered message — the error model
//! described in the spec's design notes. Handlers still return
//! `Result<T, AppError>` and propagate with `?`; internal library errors
//! (`reqwest`, `io`, etc.) fall back to [`ErrorKind::Internal`] via the
//! blanket [`From`] impl, matching the teacher's `anyhow`-wrapping idiom at
//! that boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    RateLimited,
    UpstreamRateLimited,
    UpstreamError,
    UpstreamTimeout,
    BreakerOpen,
    QueueFull,
    QueueTimeout,
    TranslationError,
    ShuttingDown,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited | ErrorKind::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::BreakerOpen | ErrorKind::QueueFull | ErrorKind::QueueTimeout | ErrorKind::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::TranslationError | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, used in the response body's `error.type`.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::TranslationError => "translation_error",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::Internal => "internal_error",
        }
    }
}

/// An application error: a kind, a human message, and optionally the
/// upstream's raw body (preserved when it was JSON and forwarded verbatim
/// per the propagation policy).
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub upstream_body: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), upstream_body: None }
    }

    pub fn with_upstream_body(mut self, body: serde_json::Value) -> Self {
        self.upstream_body = Some(body);
        self
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, msg)
    }

    pub fn unauthenticated() -> Self {
        Self::new(ErrorKind::Unauthenticated, "missing credentials")
    }

    pub fn forbidden() -> Self {
        Self::new(ErrorKind::Forbidden, "invalid credentials")
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound, "unknown endpoint")
    }

    pub fn rate_limited(retry_after_secs: f64) -> Self {
        Self::new(ErrorKind::RateLimited, format!("rate limit exceeded, retry after {retry_after_secs:.1}s"))
    }

    pub fn translation_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TranslationError, msg)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        if status.is_server_error() {
            tracing::warn!(kind = self.kind.code(), error = %self.message, "handler error");
        } else {
            tracing::debug!(kind = self.kind.code(), error = %self.message, "request rejected");
        }

        let body = json!({
            "type": "error",
            "error": {
                "type": self.kind.code(),
                "message": self.message,
            }
        });

        (status, Json(body)).into_response()
    }
}

/// Internal library errors (reqwest, io, serde_json, anyhow) become
/// [`ErrorKind::Internal`] — the boundary the teacher's blanket `From` impl
/// occupies, narrowed to a single variant rather than every 500.
impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(ErrorKind::Internal, e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidRequest, format!("malformed JSON: {e}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(ErrorKind::UpstreamTimeout, e.to_string())
        } else {
            Self::new(ErrorKind::UpstreamError, e.to_string())
        }
    }
}
