//! Session configuration and per-request options.
//!
//! ```rust
//! use std::time::Duration;
//! use sluice::SessionConfig;
//!
//! let config = SessionConfig::builder()
//!     .api_base("https://api.example.com/v9")
//!     .max_ratelimit_timeout(Duration::from_secs(10))
//!     .max_attempts(5)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_ratelimit_timeout(), Some(Duration::from_secs(10)));
//! ```

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::bucket::BucketSettings;
use crate::error::ConfigError;
use crate::jitter::Jitter;
use crate::registry::DEFAULT_EVICTION_THRESHOLD;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v9";
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
/// Delay used when a 202 asks for a retry but reports `retry_after: 0`.
pub const DEFAULT_ACCEPTED_RETRY: Duration = Duration::from_secs(5);

/// Validated session-wide settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    api_base: String,
    max_ratelimit_timeout: Option<Duration>,
    default_ratelimit_limit: i64,
    use_clock: bool,
    max_attempts: usize,
    bucket_idle_after: Duration,
    eviction_threshold: usize,
    accepted_retry_floor: Duration,
    backoff: Backoff,
    jitter: Jitter,
    user_agent: Option<String>,
    extra_headers: HeaderMap,
    proxy: Option<String>,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Longest rate-limit wait the engine will sit through; `None` waits indefinitely.
    pub fn max_ratelimit_timeout(&self) -> Option<Duration> {
        self.max_ratelimit_timeout
    }

    pub fn default_ratelimit_limit(&self) -> i64 {
        self.default_ratelimit_limit
    }

    /// Derive reset delays from the absolute reset header and the local clock.
    pub fn use_clock(&self) -> bool {
        self.use_clock
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn bucket_idle_after(&self) -> Duration {
        self.bucket_idle_after
    }

    pub fn eviction_threshold(&self) -> usize {
        self.eviction_threshold
    }

    pub fn accepted_retry_floor(&self) -> Duration {
        self.accepted_retry_floor
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn extra_headers(&self) -> &HeaderMap {
        &self.extra_headers
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub(crate) fn bucket_settings(&self) -> BucketSettings {
        BucketSettings {
            default_limit: self.default_ratelimit_limit,
            ceiling: self.max_ratelimit_timeout,
            idle_after: self.bucket_idle_after,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            api_base: DEFAULT_API_BASE.to_string(),
            max_ratelimit_timeout: None,
            default_ratelimit_limit: 1,
            use_clock: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            bucket_idle_after: Duration::from_secs(300),
            eviction_threshold: DEFAULT_EVICTION_THRESHOLD,
            accepted_retry_floor: DEFAULT_ACCEPTED_RETRY,
            backoff: Backoff::default(),
            jitter: Jitter::None,
            user_agent: None,
            extra_headers: HeaderMap::new(),
            proxy: None,
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
    headers: Vec<(String, String)>,
}

impl SessionConfigBuilder {
    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = base.into();
        self
    }

    /// Ceiling for rate-limit waits. Any longer wait fails with [`crate::HttpError::RateLimited`].
    pub fn max_ratelimit_timeout(mut self, timeout: Duration) -> Self {
        self.config.max_ratelimit_timeout = Some(timeout);
        self
    }

    /// Capacity assumed for a bucket before the server reports one. Must be >= 1.
    pub fn default_ratelimit_limit(mut self, limit: i64) -> Self {
        self.config.default_ratelimit_limit = limit;
        self
    }

    pub fn use_clock(mut self, use_clock: bool) -> Self {
        self.config.use_clock = use_clock;
        self
    }

    /// Set total attempts per request (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn bucket_idle_after(mut self, idle: Duration) -> Self {
        self.config.bucket_idle_after = idle;
        self
    }

    pub fn eviction_threshold(mut self, threshold: usize) -> Self {
        self.config.eviction_threshold = threshold;
        self
    }

    pub fn accepted_retry_floor(mut self, floor: Duration) -> Self {
        self.config.accepted_retry_floor = floor;
        self
    }

    /// Backoff between retries of transient transport failures and gateway errors.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(agent.into());
        self
    }

    /// Header sent with every request; applied last, so it overrides per-request headers.
    pub fn extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    /// Build the configuration, validating inputs.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let mut config = self.config;
        if config.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if config.default_ratelimit_limit < 1 {
            return Err(ConfigError::ZeroLimit);
        }
        if config.eviction_threshold == 0 {
            return Err(ConfigError::ZeroEvictionThreshold);
        }
        let base = config.api_base.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::InvalidApiBase(config.api_base));
        }
        config.api_base = base.to_string();
        for (name, value) in self.headers {
            let (name, value) = parse_header(&name, &value)?;
            config.extra_headers.insert(name, value);
        }
        Ok(config)
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), ConfigError> {
    let header = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ConfigError::InvalidHeader(name.to_string()))?;
    let value =
        HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader(name.to_string()))?;
    Ok((header, value))
}

/// Per-request inputs beyond the route itself.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub(crate) body: Option<Bytes>,
    pub(crate) json: bool,
    pub(crate) headers: HeaderMap,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) reason: Option<String>,
    pub(crate) auth: bool,
    pub(crate) ceiling: Option<Option<Duration>>,
    pub(crate) proxy: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            body: None,
            json: false,
            headers: HeaderMap::new(),
            query: Vec::new(),
            reason: None,
            auth: true,
            ceiling: None,
            proxy: None,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `payload` as the JSON body.
    pub fn json<T>(mut self, payload: &T) -> Result<Self, serde_json::Error>
    where
        T: serde::Serialize + ?Sized,
    {
        self.body = Some(Bytes::from(serde_json::to_vec(payload)?));
        self.json = true;
        Ok(self)
    }

    /// Raw body; no content type is set.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self.json = false;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Audit-log reason, sent percent-encoded.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Whether to attach the session token. Defaults to `true`.
    pub fn auth(mut self, auth: bool) -> Self {
        self.auth = auth;
        self
    }

    /// Override the session's rate-limit ceiling for this call (`None` waits indefinitely).
    pub fn max_ratelimit_timeout(mut self, ceiling: Option<Duration>) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_behavior() {
        let config = SessionConfig::builder().build().unwrap();
        assert_eq!(config.api_base(), DEFAULT_API_BASE);
        assert_eq!(config.max_attempts(), 5);
        assert_eq!(config.max_ratelimit_timeout(), None);
        assert_eq!(config.default_ratelimit_limit(), 1);
        assert!(!config.use_clock());
        assert_eq!(config.eviction_threshold(), 256);
        assert_eq!(config.bucket_idle_after(), Duration::from_secs(300));
        assert_eq!(config.backoff().delay(2), Duration::from_secs(5));
    }

    #[test]
    fn ceiling_flows_into_bucket_settings() {
        let config =
            SessionConfig::builder().max_ratelimit_timeout(Duration::from_secs(5)).build().unwrap();
        assert_eq!(config.max_ratelimit_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.bucket_settings().ceiling, Some(Duration::from_secs(5)));

        let opts = RequestOptions::new().max_ratelimit_timeout(None);
        assert_eq!(opts.ceiling, Some(None));
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert_eq!(
            SessionConfig::builder().max_attempts(0).build().unwrap_err(),
            ConfigError::ZeroAttempts
        );
        assert_eq!(
            SessionConfig::builder().default_ratelimit_limit(0).build().unwrap_err(),
            ConfigError::ZeroLimit
        );
        assert_eq!(
            SessionConfig::builder().eviction_threshold(0).build().unwrap_err(),
            ConfigError::ZeroEvictionThreshold
        );
        assert!(matches!(
            SessionConfig::builder().api_base("ftp://x").build(),
            Err(ConfigError::InvalidApiBase(_))
        ));
        assert!(matches!(
            SessionConfig::builder().extra_header("bad header", "v").build(),
            Err(ConfigError::InvalidHeader(_))
        ));
    }

    #[test]
    fn trailing_slash_is_trimmed_and_headers_parsed() {
        let config = SessionConfig::builder()
            .api_base("https://api.example.com/v9/")
            .extra_header("X-Super-Properties", "abc")
            .build()
            .unwrap();
        assert_eq!(config.api_base(), "https://api.example.com/v9");
        assert_eq!(config.extra_headers().get("x-super-properties").unwrap(), "abc");
    }

    #[test]
    fn request_options_json_body() {
        let opts = RequestOptions::new().json(&serde_json::json!({"content": "hi"})).unwrap();
        assert!(opts.json);
        assert_eq!(opts.body.as_deref(), Some(&b"{\"content\":\"hi\"}"[..]));
        assert!(opts.auth);
    }
}
