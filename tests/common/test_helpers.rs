#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::Value;
use sluice::{
    Challenge, ChallengeSolution, ChallengeSolver, Method, OutboundRequest, Route, Session,
    SessionConfig, TrackingSleeper, Transport, TransportError, TransportErrorKind,
    TransportResponse,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// A canned response.
#[derive(Debug, Clone)]
pub struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            headers,
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn ok() -> Self {
        Self::json(200, serde_json::json!({}))
    }

    pub fn header(mut self, name: &'static str, value: impl ToString) -> Self {
        self.headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(&value.to_string()).unwrap(),
        );
        self
    }

    /// Attach application-level rate-limit headers.
    pub fn bucket(self, hash: &str, limit: i64, remaining: i64, reset_after: f64) -> Self {
        self.header("x-ratelimit-bucket", hash)
            .header("x-ratelimit-limit", limit)
            .header("x-ratelimit-remaining", remaining)
            .header("x-ratelimit-reset-after", reset_after)
            .via()
    }

    /// Mark the response as having passed through the API's own proxy.
    pub fn via(self) -> Self {
        self.header("via", "1.1 google")
    }

    fn into_response(self) -> TransportResponse {
        TransportResponse { status: self.status, headers: self.headers, body: self.body }
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Reply(Reply),
    Fail(TransportErrorKind),
}

/// A request as the transport saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub at: Instant,
    pub request: OutboundRequest,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.request.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<Recorded>>,
    latency: Duration,
}

/// Transport that replays a script, then answers `200 {}` once it runs out.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self::with_latency(steps, Duration::ZERO)
    }

    /// Each call takes `latency` before answering.
    pub fn with_latency(steps: impl IntoIterator<Item = Step>, latency: Duration) -> Self {
        Self {
            state: Arc::new(MockState {
                script: Mutex::new(steps.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
                latency,
            }),
        }
    }

    pub fn replies(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self::new(replies.into_iter().map(Step::Reply))
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.state.requests.lock().unwrap().push(Recorded { at: Instant::now(), request });
        if !self.state.latency.is_zero() {
            tokio::time::sleep(self.state.latency).await;
        }
        let step = self.state.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(reply)) => Ok(reply.into_response()),
            Some(Step::Fail(kind)) => Err(TransportError::new(kind, "scripted failure")),
            None => Ok(Reply::ok().into_response()),
        }
    }
}

/// Solver that answers every challenge with a fixed key, or fails when `key` is `None`.
#[derive(Debug, Clone)]
pub struct FixedSolver {
    key: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl FixedSolver {
    pub fn new(key: &str) -> Self {
        Self { key: Some(key.to_string()), calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn failing() -> Self {
        Self { key: None, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct SolverError;

impl std::fmt::Display for SolverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "solver unavailable")
    }
}

impl std::error::Error for SolverError {}

#[async_trait]
impl ChallengeSolver for FixedSolver {
    async fn solve(
        &self,
        _challenge: &Challenge,
    ) -> Result<ChallengeSolution, sluice::BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.key {
            Some(key) => Ok(ChallengeSolution { key: key.clone() }),
            None => Err(Box::new(SolverError)),
        }
    }
}

pub const API_BASE: &str = "https://api.example.com/v9";

pub fn config() -> sluice::SessionConfigBuilder {
    SessionConfig::builder().api_base(API_BASE)
}

/// Session over `transport` with a tracking sleeper, for paused-clock tests.
pub fn session_with(
    config: SessionConfig,
    transport: &MockTransport,
    sleeper: &TrackingSleeper,
) -> Session {
    Session::builder(config)
        .transport(transport.clone())
        .with_sleeper(sleeper.clone())
        .token("test-token")
        .build()
        .expect("session")
}

pub fn messages(channel_id: u64) -> Route {
    Route::builder(Method::POST, "/channels/{channel_id}/messages")
        .param("channel_id", channel_id)
        .build()
        .expect("route")
}

pub fn guild(guild_id: u64) -> Route {
    Route::builder(Method::GET, "/guilds/{guild_id}")
        .param("guild_id", guild_id)
        .build()
        .expect("route")
}

/// Let spawned tasks run under a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
