//! The request orchestrator.
//!
//! A [`Session`] owns the bucket registry and the global gate, and drives every request
//! through a bounded attempt loop:
//!
//! 1. wait for the global gate to open;
//! 2. resolve the bucket key and acquire a slot;
//! 3. send through the [`Transport`];
//! 4. adopt the bucket hash the response reports, migrating state to the new key;
//! 5. feed the rate-limit headers into the bucket;
//! 6. classify the response: return, retry after a delay, or fail.
//!
//! The slot is released when the attempt ends, whichever way it ends.

use std::fmt;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use regex::Regex;
use serde_json::Value;
use tower::util::BoxCloneService;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::bucket::Bucket;
use crate::challenge::{Challenge, ChallengeSolver};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{RequestOptions, SessionConfig};
use crate::error::{BoxError, ConfigError, HttpError, HttpFailure};
use crate::gate::GlobalGate;
use crate::headers::{secs, RateLimitHeaders};
use crate::registry::BucketRegistry;
use crate::response::ResponseBody;
use crate::route::Route;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{
    emit_best_effort, BucketEvent, EngineEvent, GateEvent, LimitScope, NullSink, RateLimitEvent,
    RequestOutcome, RetryEvent, RetryReason, TelemetrySink,
};
use crate::transport::{OutboundRequest, Transport, TransportError, TransportErrorKind};

const X_AUDIT_LOG_REASON: HeaderName = HeaderName::from_static("x-audit-log-reason");
const X_FAILED_REQUESTS: HeaderName = HeaderName::from_static("x-failed-requests");
const ATTEMPTS_PARAM: &str = "attempts";

/// Gateway statuses that are always retried with backoff.
const RETRY_STATUSES: [u16; 6] = [502, 504, 507, 522, 523, 524];

/// 202 error codes meaning "accepted, ask again later".
const ACCEPTED_RETRY_CODES: std::ops::Range<i64> = 110_000..119_999;

static BAN_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<span>(\d{3,4})</span>").expect("ban code pattern should compile")
});

type BoxSink = BoxCloneService<EngineEvent, (), BoxError>;

fn boxed_sink<S>(sink: S) -> BoxSink
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    BoxCloneService::new(sink.map_err(|e| Box::new(e) as BoxError))
}

/// A 429 that will be waited out.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RateLimitHit {
    retry_after: Duration,
    global: bool,
    edge: bool,
}

impl RateLimitHit {
    fn scope(&self) -> LimitScope {
        if self.global {
            LimitScope::Global
        } else if self.edge {
            LimitScope::Edge
        } else {
            LimitScope::Route
        }
    }
}

/// Client-side request engine for one credential.
pub struct Session {
    config: SessionConfig,
    registry: BucketRegistry,
    gate: GlobalGate,
    transport: Arc<dyn Transport>,
    solver: Option<Arc<dyn ChallengeSolver>>,
    token: Option<HeaderValue>,
    user_agent: Option<HeaderValue>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Mutex<BoxSink>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("buckets", &self.registry.len())
            .field("gate_open", &self.gate.is_open())
            .field("transport", &self.transport)
            .field("solver", &self.solver)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &GlobalGate {
        &self.gate
    }

    /// Issue `route` and return its decoded body.
    ///
    /// Rate limits, accepted-but-pending responses, flaky gateways, recoverable transport
    /// failures and solvable challenges are absorbed by retrying, up to the configured number of
    /// attempts. Everything else surfaces as an [`HttpError`].
    pub async fn request(
        &self,
        route: &Route,
        options: RequestOptions,
    ) -> Result<ResponseBody, HttpError> {
        let started = self.clock.now();
        let mut attempts = 0;
        let result = self.run(route, options, &mut attempts).await;
        let duration = self.clock.now().saturating_sub(started);

        let outcome = match &result {
            Ok((status, _)) => RequestOutcome::Success {
                route: route.to_string(),
                status: status.as_u16(),
                attempts,
                duration,
            },
            Err(err) => RequestOutcome::Failure {
                route: route.to_string(),
                status: err.status().map(|s| s.as_u16()),
                attempts,
                duration,
            },
        };
        self.emit(EngineEvent::Request(outcome)).await;
        result.map(|(_, body)| body)
    }

    async fn run(
        &self,
        route: &Route,
        options: RequestOptions,
        attempts: &mut usize,
    ) -> Result<(StatusCode, ResponseBody), HttpError> {
        let label = route.to_string();
        let max_attempts = self.config.max_attempts();
        let ceiling = options.ceiling.unwrap_or(self.config.max_ratelimit_timeout());
        let url = route.url(self.config.api_base());
        let proxy = options.proxy.clone().or_else(|| self.config.proxy().map(str::to_owned));
        let mut headers = self.headers_for(&options);
        let mut query = options.query.clone();
        let mut failed = 0usize;
        let mut last: Option<HttpFailure> = None;

        for attempt in 0..max_attempts {
            *attempts = attempt + 1;
            let is_last = attempt + 1 == max_attempts;
            if let Err(left) = self.gate.wait_open_within(ceiling).await {
                return Err(self.ceiling_exceeded(&label, left, false).await);
            }

            let (mut key, hash) = self.registry.resolve(route);
            let bucket = self.registry.bucket_for(&key);
            let permit = bucket.acquire(ceiling).await?;

            if failed > 0 {
                headers.insert(X_FAILED_REQUESTS, HeaderValue::from(failed));
            }
            let request = OutboundRequest {
                method: route.method().clone(),
                url: url.clone(),
                query: query.clone(),
                headers: headers.clone(),
                body: options.body.clone(),
                proxy: proxy.clone(),
            };

            let response = match self.transport.send(request).await {
                Ok(response) => response,
                Err(err) if err.is_recoverable() && !is_last => {
                    drop(permit);
                    failed += 1;
                    let Some(delay) = self.backoff(&label, attempt, ceiling) else {
                        return Err(HttpError::Transport { attempts: attempt + 1, source: err });
                    };
                    warn!(
                        route = %label,
                        attempt = attempt + 1,
                        error = %err,
                        delay_secs = delay.as_secs_f64(),
                        "transport failure; retrying"
                    );
                    self.pause(&label, attempt, RetryReason::Transport(err.kind()), delay).await;
                    continue;
                }
                Err(err) => {
                    warn!(route = %label, attempt = attempt + 1, error = %err, "transport failure");
                    return Err(HttpError::Transport { attempts: attempt + 1, source: err });
                }
            };

            let status = response.status;
            let body = ResponseBody::json_or_text(&response.headers, &response.body);
            let limits = RateLimitHeaders::from_headers(&response.headers);
            debug!(route = %label, status = status.as_u16(), "request returned");

            if let Some(discovered) = limits.bucket.as_deref() {
                if let Some(new_key) =
                    self.adopt_hash(route, &key, hash.as_deref(), discovered, permit.bucket()).await
                {
                    key = new_key;
                }
            }

            if limits.has_bucket_info() && status != StatusCode::TOO_MANY_REQUESTS {
                permit.bucket().update(&limits, self.config.use_clock());
                if permit.bucket().remaining() == 0 {
                    debug!(
                        bucket = %key,
                        "rate limit bucket exhausted; pre-emptively rate limiting"
                    );
                    let exhausted = BucketEvent::Exhausted { key: key.clone() };
                    self.emit(EngineEvent::Bucket(exhausted)).await;
                }
            }

            if status == StatusCode::ACCEPTED && is_accepted_retry(&body) {
                bump_attempts(&mut query);
                let delay = body
                    .field("retry_after")
                    .and_then(Value::as_f64)
                    .map(secs)
                    .filter(|d| !d.is_zero())
                    .unwrap_or(self.config.accepted_retry_floor());
                if ceiling.is_some_and(|c| delay > c) {
                    return Err(self.ceiling_exceeded(&label, delay, false).await);
                }
                debug!(
                    route = %label,
                    retry_after_secs = delay.as_secs_f64(),
                    "received 202; retrying"
                );
                last = Some(HttpFailure::new(status, body));
                drop(permit);
                self.pause(&label, attempt, RetryReason::Accepted, delay).await;
                continue;
            }

            if status.is_success() {
                debug!(route = %label, status = status.as_u16(), "request succeeded");
                return Ok((status, body));
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let hit = parse_rate_limit(status, &body, &limits)?;
                let sub_limit = permit.bucket().remaining() > 0;
                if sub_limit {
                    debug!(
                        route = %label,
                        remaining = permit.bucket().remaining(),
                        "429 despite remaining capacity; sub-limit hit"
                    );
                }
                if ceiling.is_some_and(|c| hit.retry_after > c) {
                    return Err(self.ceiling_exceeded(&label, hit.retry_after, hit.edge).await);
                }
                warn!(
                    route = %label,
                    retry_after_secs = hit.retry_after.as_secs_f64(),
                    scope = limits.scope.as_deref().unwrap_or("unknown"),
                    bucket = %key,
                    "rate limited; retrying"
                );
                self.emit(EngineEvent::RateLimit(RateLimitEvent::Hit {
                    route: label.clone(),
                    scope: hit.scope(),
                    retry_after: hit.retry_after,
                    sub_limit,
                }))
                .await;
                last = Some(HttpFailure::new(status, body));

                let gate = hit.global.then(|| self.gate.close(hit.retry_after));
                if gate.is_some() {
                    let secs = hit.retry_after.as_secs_f64();
                    warn!(retry_after_secs = secs, "global rate limit hit");
                    let closed = GateEvent::Closed { retry_after: hit.retry_after };
                    self.emit(EngineEvent::Gate(closed)).await;
                }
                if hit.edge {
                    warn!(retry_after_secs = hit.retry_after.as_secs_f64(), "edge rate limit hit");
                }
                self.pause(&label, attempt, RetryReason::RateLimited, hit.retry_after).await;
                if let Some(gate) = gate {
                    drop(gate);
                    info!("global rate limit over");
                    self.emit(EngineEvent::Gate(GateEvent::Reopened)).await;
                }
                continue;
            }

            if RETRY_STATUSES.contains(&status.as_u16()) {
                drop(permit);
                failed += 1;
                let Some(delay) = self.backoff(&label, attempt, ceiling) else {
                    return Err(HttpError::from_failure(HttpFailure::new(status, body)));
                };
                warn!(
                    route = %label,
                    status = status.as_u16(),
                    delay_secs = delay.as_secs_f64(),
                    "upstream error; retrying"
                );
                last = Some(HttpFailure::new(status, body));
                self.pause(&label, attempt, RetryReason::ServerError(status.as_u16()), delay).await;
                continue;
            }

            let failure = HttpFailure::new(status, body);
            if matches!(status.as_u16(), 403 | 404) || status.is_server_error() {
                return Err(HttpError::from_failure(failure));
            }
            let Some(challenge) = Challenge::from_body(&failure.body) else {
                return Err(HttpError::Http(failure));
            };
            drop(permit);

            let solver = match &self.solver {
                Some(solver) if !is_last => solver,
                _ => {
                    return Err(HttpError::ChallengeRequired {
                        failure,
                        challenge: Box::new(challenge),
                        source: None,
                    })
                }
            };
            match solver.solve(&challenge).await {
                Ok(solution) => {
                    solution.apply(&challenge, &mut headers);
                    debug!(route = %label, "challenge solved; retrying");
                    last = Some(failure);
                    self.pause(&label, attempt, RetryReason::Challenge, Duration::ZERO).await;
                }
                Err(source) => {
                    warn!(route = %label, error = %source, "challenge solver failed");
                    return Err(HttpError::ChallengeRequired {
                        failure,
                        challenge: Box::new(challenge),
                        source: Some(source),
                    });
                }
            }
        }

        warn!(route = %label, attempts = max_attempts, "request attempts exhausted");
        let exhausted = RetryEvent::Exhausted { route: label, attempts: max_attempts };
        self.emit(EngineEvent::Retry(exhausted)).await;
        Err(match last {
            Some(failure) if failure.status.is_server_error() => HttpError::ServerError(failure),
            Some(failure) => HttpError::Http(failure),
            None => HttpError::Transport {
                attempts: max_attempts,
                source: TransportError::new(TransportErrorKind::Other, "no response received"),
            },
        })
    }

    /// Adopt the bucket hash a response reported. Returns the new bucket key when state moved.
    async fn adopt_hash(
        &self,
        route: &Route,
        key: &str,
        known: Option<&str>,
        discovered: &str,
        bucket: &Arc<Bucket>,
    ) -> Option<String> {
        if known == Some(discovered) {
            return None;
        }
        let route_key = route.key();
        let event = match known {
            Some(previous) => BucketEvent::HashChanged {
                route: route_key,
                from: previous.to_string(),
                to: discovered.to_string(),
            },
            // A concurrent request on this route got there first.
            None if self.registry.lookup(&route_key).is_some() => return None,
            None => BucketEvent::HashDiscovered { route: route_key, hash: discovered.to_string() },
        };
        let new_key = self.registry.migrate(route, key, discovered, bucket);
        self.emit(EngineEvent::Bucket(event)).await;
        Some(new_key)
    }

    fn headers_for(&self, options: &RequestOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(agent) = &self.user_agent {
            headers.insert(USER_AGENT, agent.clone());
        }
        if options.auth {
            if let Some(token) = &self.token {
                headers.insert(AUTHORIZATION, token.clone());
            }
        }
        if let Some(reason) = options.reason.as_deref() {
            if let Ok(value) = HeaderValue::from_str(&urlencoding::encode(reason)) {
                headers.insert(X_AUDIT_LOG_REASON, value);
            }
        }
        if options.json {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in self.config.extra_headers() {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    /// Pacing between failed attempts. `None` when the delay would outlast the caller's
    /// ceiling, in which case the failure is surfaced instead of waited out.
    fn backoff(&self, route: &str, attempt: usize, ceiling: Option<Duration>) -> Option<Duration> {
        let delay = self.config.jitter().apply(self.config.backoff().delay(attempt));
        if ceiling.is_some_and(|c| delay > c) {
            warn!(
                route = %route,
                delay_secs = delay.as_secs_f64(),
                "retry backoff exceeds ceiling; failing instead"
            );
            return None;
        }
        Some(delay)
    }

    async fn pause(&self, route: &str, attempt: usize, reason: RetryReason, delay: Duration) {
        let event =
            RetryEvent::Attempt { route: route.to_string(), attempt: attempt + 1, reason, delay };
        self.emit(EngineEvent::Retry(event)).await;
        if !delay.is_zero() {
            self.sleeper.sleep(delay).await;
        }
    }

    async fn ceiling_exceeded(&self, route: &str, retry_after: Duration, edge: bool) -> HttpError {
        warn!(
            route = %route,
            retry_after_secs = retry_after.as_secs_f64(),
            "rate limit wait exceeds ceiling; failing instead"
        );
        let event = RateLimitEvent::CeilingExceeded { route: route.to_string(), retry_after };
        self.emit(EngineEvent::RateLimit(event)).await;
        HttpError::RateLimited { retry_after, edge }
    }

    async fn emit(&self, event: EngineEvent) {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
        emit_best_effort(sink, event).await;
    }
}

fn is_accepted_retry(body: &ResponseBody) -> bool {
    body.field("code").and_then(Value::as_i64).is_some_and(|c| ACCEPTED_RETRY_CODES.contains(&c))
}

fn bump_attempts(query: &mut Vec<(String, String)>) {
    match query.iter_mut().find(|(name, _)| name == ATTEMPTS_PARAM) {
        Some((_, value)) => *value = (value.parse::<u64>().unwrap_or(0) + 1).to_string(),
        None => query.push((ATTEMPTS_PARAM.to_string(), "1".to_string())),
    }
}

/// Read the delay and scope of a 429. A text body with no usable `Retry-After` is an edge ban
/// and cannot be waited out.
fn parse_rate_limit(
    status: StatusCode,
    body: &ResponseBody,
    limits: &RateLimitHeaders,
) -> Result<RateLimitHit, HttpError> {
    let edge = !limits.via;
    let (global, mut seconds) = match body {
        ResponseBody::Text(text) => match limits.retry_after.filter(|s| *s > 0.0) {
            Some(seconds) => (false, seconds),
            None => {
                let code = BAN_CODE
                    .captures(text)
                    .and_then(|c| c.get(1))
                    .map_or("unknown", |m| m.as_str())
                    .to_string();
                let mut failure = HttpFailure::new(status, body.clone());
                failure.message = format!("edge ban (code: {code})");
                return Err(HttpError::Http(failure));
            }
        },
        ResponseBody::Json(value) => (
            value.get("global").and_then(Value::as_bool).unwrap_or(false) || limits.global,
            value.get("retry_after").and_then(Value::as_f64).or(limits.retry_after).unwrap_or(0.0),
        ),
    };
    // Some edges report the body delay in milliseconds.
    if let Some(header) = limits.retry_after {
        if seconds > 0.0 && (header - seconds / 1000.0).abs() < 1e-9 {
            seconds /= 1000.0;
        }
    }
    Ok(RateLimitHit { retry_after: secs(seconds), global, edge })
}

#[cfg(feature = "reqwest")]
fn default_transport() -> Result<Arc<dyn Transport>, ConfigError> {
    Ok(Arc::new(crate::transport::ReqwestTransport::default()))
}

#[cfg(not(feature = "reqwest"))]
fn default_transport() -> Result<Arc<dyn Transport>, ConfigError> {
    Err(ConfigError::MissingTransport)
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    solver: Option<Arc<dyn ChallengeSolver>>,
    token: Option<String>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    sink: BoxSink,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            transport: None,
            solver: None,
            token: None,
            clock: None,
            sleeper: None,
            sink: boxed_sink(NullSink),
        }
    }

    /// Use a custom transport. Defaults to `ReqwestTransport` when the `reqwest` feature is on.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Answer challenges with `solver` instead of failing with `ChallengeRequired`.
    pub fn solver<S: ChallengeSolver + 'static>(mut self, solver: S) -> Self {
        self.solver = Some(Arc::new(solver));
        self
    }

    /// Credential sent verbatim as `Authorization`.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Use a custom sleeper (helpful for tests and simulations).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    /// Deliver engine events to `sink`.
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.sink = boxed_sink(sink);
        self
    }

    pub fn build(self) -> Result<Session, ConfigError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let token = self
            .token
            .map(|token| {
                HeaderValue::from_str(&token).map(|mut value| {
                    value.set_sensitive(true);
                    value
                })
            })
            .transpose()
            .map_err(|_| ConfigError::InvalidHeader(AUTHORIZATION.to_string()))?;
        let user_agent = self
            .config
            .user_agent()
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|_| ConfigError::InvalidHeader(USER_AGENT.to_string()))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));
        let registry = BucketRegistry::new(
            self.config.bucket_settings(),
            self.config.eviction_threshold(),
            Arc::clone(&clock),
            Arc::clone(&sleeper),
        );
        Ok(Session {
            config: self.config,
            registry,
            gate: GlobalGate::new(),
            transport,
            solver: self.solver,
            token,
            user_agent,
            clock,
            sleeper,
            sink: Mutex::new(self.sink),
        })
    }
}
