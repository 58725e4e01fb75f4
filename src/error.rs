//! Error types surfaced by the request engine.
use http::StatusCode;
use std::fmt;
use std::time::Duration;

use crate::challenge::Challenge;
use crate::response::ResponseBody;
use crate::transport::TransportError;

/// Boxed error used at the collaborator seams (solvers, transports).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A non-success HTTP response, with the API's error code and message when the body has them.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpFailure {
    pub status: StatusCode,
    pub body: ResponseBody,
    /// API-specific error code; `0` when the body carries none.
    pub code: i64,
    pub message: String,
}

impl HttpFailure {
    pub fn new(status: StatusCode, body: ResponseBody) -> Self {
        let (code, message) = match &body {
            ResponseBody::Json(value) => {
                let code = value.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                let mut message =
                    value.get("message").and_then(|m| m.as_str()).unwrap_or_default().to_string();
                if let Some(errors) = value.get("errors") {
                    let mut lines = Vec::new();
                    flatten_errors(errors, String::new(), &mut lines);
                    if !lines.is_empty() {
                        message = format!("{}\n{}", message, lines.join("\n"));
                    }
                }
                (code, message)
            }
            ResponseBody::Text(text) => (0, text.clone()),
        };
        Self { status, body, code, message }
    }
}

/// Flatten nested `{"errors": {"field": {"_errors": [{"message": ..}]}}}` into readable lines.
fn flatten_errors(value: &serde_json::Value, path: String, out: &mut Vec<String>) {
    let Some(map) = value.as_object() else { return };
    for (key, inner) in map {
        if key == "_errors" {
            let messages: Vec<&str> = inner
                .as_array()
                .map(|errs| errs.iter().filter_map(|e| e.get("message")?.as_str()).collect())
                .unwrap_or_default();
            out.push(format!("In {}: {}", path, messages.join(" ")));
            continue;
        }
        let next = if path.is_empty() { key.clone() } else { format!("{}.{}", path, key) };
        flatten_errors(inner, next, out);
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = self.status.canonical_reason().unwrap_or("Unknown");
        write!(f, "{} {} (error code: {})", self.status.as_u16(), reason, self.code)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// Unified error type for a request issued through the engine.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The wait required by a rate limit exceeds the configured ceiling.
    #[error("rate limited; retry after {retry_after:?} (edge: {edge})")]
    RateLimited { retry_after: Duration, edge: bool },
    #[error("forbidden: {0}")]
    Forbidden(HttpFailure),
    #[error("not found: {0}")]
    NotFound(HttpFailure),
    #[error("server error: {0}")]
    ServerError(HttpFailure),
    /// The API demanded a challenge that could not be (or was no longer) solved.
    #[error("challenge required: {failure}")]
    ChallengeRequired {
        failure: HttpFailure,
        challenge: Box<Challenge>,
        #[source]
        source: Option<BoxError>,
    },
    /// Transport kept failing until the attempt ceiling, or failed unrecoverably.
    #[error("transport failed after {attempts} attempt(s)")]
    Transport {
        attempts: usize,
        #[source]
        source: TransportError,
    },
    #[error("{0}")]
    Http(HttpFailure),
}

impl HttpError {
    /// Classify a terminal non-success response.
    pub(crate) fn from_failure(failure: HttpFailure) -> Self {
        match failure.status.as_u16() {
            403 => HttpError::Forbidden(failure),
            404 => HttpError::NotFound(failure),
            s if s >= 500 => HttpError::ServerError(failure),
            _ => HttpError::Http(failure),
        }
    }

    /// Check if this error is a rate-limit failure
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Server-requested delay, for rate-limit failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Borrow the failed response if this error carries one.
    pub fn failure(&self) -> Option<&HttpFailure> {
        match self {
            Self::Forbidden(f)
            | Self::NotFound(f)
            | Self::ServerError(f)
            | Self::Http(f)
            | Self::ChallengeRequired { failure: f, .. } => Some(f),
            Self::RateLimited { .. } | Self::Transport { .. } => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.failure().map(|f| f.status)
    }
}

/// Errors raised while building a [`crate::Route`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("unbalanced braces in path template `{0}`")]
    UnbalancedBraces(String),
    #[error("placeholder `{{{name}}}` in `{template}` has no value")]
    MissingParameter { template: String, name: String },
    #[error("parameter `{name}` does not appear in `{template}`")]
    UnknownParameter { template: String, name: String },
    #[error("path template must start with `/`: `{0}`")]
    RelativePath(String),
}

/// Errors returned by configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("default_ratelimit_limit must be at least 1")]
    ZeroLimit,
    #[error("eviction_threshold must be at least 1")]
    ZeroEvictionThreshold,
    #[error("invalid api base `{0}`")]
    InvalidApiBase(String),
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
    #[error("no transport configured and the `reqwest` feature is disabled")]
    MissingTransport,
}
