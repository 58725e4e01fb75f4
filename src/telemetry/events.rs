use std::fmt;
use std::time::Duration;

use crate::transport::TransportErrorKind;

/// Events emitted by the request engine.
///
/// Every decision the orchestrator takes (adopting a bucket hash, sleeping on a 429, retrying a
/// flaky gateway, closing the global gate) is described by one of these. They can be logged,
/// collected in tests, or forwarded elsewhere through a [`super::TelemetrySink`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Bucket identity and capacity events
    Bucket(BucketEvent),
    /// 429 handling events
    RateLimit(RateLimitEvent),
    /// Retry events
    Retry(RetryEvent),
    /// Global gate transitions
    Gate(GateEvent),
    /// Final outcome of a request
    Request(RequestOutcome),
}

/// Events about bucket identity and capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEvent {
    /// A route reported its bucket hash for the first time.
    HashDiscovered { route: String, hash: String },
    /// A route's bucket hash changed; state moved to the new key.
    HashChanged { route: String, from: String, to: String },
    /// A response left the bucket with no remaining capacity.
    Exhausted { key: String },
}

/// Which limit produced a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// Session-wide limit; every route is paused.
    Global,
    /// Limit of the route's own bucket.
    Route,
    /// Limit applied by the edge proxy in front of the API.
    Edge,
}

/// Events emitted while handling 429 responses.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitEvent {
    /// A 429 was received and will be waited out.
    Hit {
        route: String,
        scope: LimitScope,
        retry_after: Duration,
        /// The bucket still reported capacity, so a hidden sub-limit was hit.
        sub_limit: bool,
    },
    /// The requested wait exceeds the configured ceiling; the request fails instead.
    CeilingExceeded { route: String, retry_after: Duration },
}

/// Why an attempt is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// 202 with an "accepted, retry later" error code.
    Accepted,
    /// 429 response.
    RateLimited,
    /// Transient gateway / upstream status.
    ServerError(u16),
    /// Recoverable transport failure.
    Transport(TransportErrorKind),
    /// A challenge was solved and the request is replayed.
    Challenge,
}

/// Events emitted by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// Emitted before sleeping and retrying.
    Attempt {
        route: String,
        /// The attempt that just finished (1-indexed)
        attempt: usize,
        reason: RetryReason,
        delay: Duration,
    },
    /// The attempt ceiling was reached.
    Exhausted { route: String, attempts: usize },
}

/// Global gate transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    Closed { retry_after: Duration },
    Reopened,
}

/// Final outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { route: String, status: u16, attempts: usize, duration: Duration },
    Failure { route: String, status: Option<u16>, attempts: usize, duration: Duration },
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::Bucket(event) => write!(f, "Bucket::{}", event),
            EngineEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            EngineEvent::Retry(event) => write!(f, "Retry::{}", event),
            EngineEvent::Gate(event) => write!(f, "Gate::{}", event),
            EngineEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for BucketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketEvent::HashDiscovered { route, hash } => {
                write!(f, "HashDiscovered({} -> {})", route, hash)
            }
            BucketEvent::HashChanged { route, from, to } => {
                write!(f, "HashChanged({}: {} -> {})", route, from, to)
            }
            BucketEvent::Exhausted { key } => write!(f, "Exhausted({})", key),
        }
    }
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Global => write!(f, "global"),
            LimitScope::Route => write!(f, "route"),
            LimitScope::Edge => write!(f, "edge"),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Hit { route, scope, retry_after, sub_limit } => {
                write!(f, "Hit({}, scope={}, retry_after={:?}", route, scope, retry_after)?;
                if *sub_limit {
                    write!(f, ", sub_limit")?;
                }
                write!(f, ")")
            }
            RateLimitEvent::CeilingExceeded { route, retry_after } => {
                write!(f, "CeilingExceeded({}, retry_after={:?})", route, retry_after)
            }
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Accepted => write!(f, "accepted"),
            RetryReason::RateLimited => write!(f, "rate_limited"),
            RetryReason::ServerError(status) => write!(f, "server_error({})", status),
            RetryReason::Transport(kind) => write!(f, "transport({})", kind),
            RetryReason::Challenge => write!(f, "challenge"),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { route, attempt, reason, delay } => {
                write!(f, "Attempt({}, #{}, reason={}, delay={:?})", route, attempt, reason, delay)
            }
            RetryEvent::Exhausted { route, attempts } => {
                write!(f, "Exhausted({}, attempts={})", route, attempts)
            }
        }
    }
}

impl fmt::Display for GateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateEvent::Closed { retry_after } => write!(f, "Closed(retry_after={:?})", retry_after),
            GateEvent::Reopened => write!(f, "Reopened"),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { route, status, attempts, duration } => write!(
                f,
                "Success({}, status={}, attempts={}, duration={:?})",
                route, status, attempts, duration
            ),
            RequestOutcome::Failure { route, status, attempts, duration } => {
                write!(f, "Failure({}, status=", route)?;
                match status {
                    Some(status) => write!(f, "{}", status)?,
                    None => write!(f, "none")?,
                }
                write!(f, ", attempts={}, duration={:?})", attempts, duration)
            }
        }
    }
}
