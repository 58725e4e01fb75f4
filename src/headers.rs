//! Parsing of the rate-limit headers a response may carry.
//!
//! Every field is optional; a header that is absent or unparsable reads as `None`.

use http::HeaderMap;
use std::time::Duration;

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";
pub const VIA: &str = "via";

/// Rate-limit information extracted from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    /// Seconds until the window resets.
    pub reset_after: Option<f64>,
    /// Absolute reset time, seconds since the Unix epoch.
    pub reset: Option<f64>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    /// Raw `Retry-After`, in seconds.
    pub retry_after: Option<f64>,
    /// Whether the response passed through the API's own proxy layer.
    pub via: bool,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: parse(headers, LIMIT),
            remaining: parse(headers, REMAINING),
            reset_after: parse_secs(headers, RESET_AFTER),
            reset: parse_secs(headers, RESET),
            bucket: text(headers, BUCKET).map(str::to_owned),
            global: text(headers, GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            scope: text(headers, SCOPE).map(str::to_owned),
            retry_after: parse_secs(headers, RETRY_AFTER),
            via: text(headers, VIA).is_some_and(|v| !v.is_empty()),
        }
    }

    /// Whether the response carried live bucket information.
    pub fn has_bucket_info(&self) -> bool {
        self.remaining.is_some()
    }
}

fn text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse(headers: &HeaderMap, name: &str) -> Option<i64> {
    let raw = text(headers, name)?;
    raw.parse::<i64>().ok().or_else(|| raw.parse::<f64>().ok().map(|f| f as i64))
}

fn parse_secs(headers: &HeaderMap, name: &str) -> Option<f64> {
    text(headers, name)?.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Convert fractional seconds to a `Duration`, clamping negatives to zero.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}
