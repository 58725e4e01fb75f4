#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # sluice
//!
//! Client-side request engine for HTTP APIs whose rate limits are discovered at runtime.
//!
//! The server groups routes into opaque *buckets* and reports each bucket's capacity in response
//! headers. `sluice` learns those buckets as responses arrive, queues callers that would overrun
//! them, pauses everything on a global limit, and retries the transient failures that such APIs
//! produce (accepted-but-pending responses, flaky gateways, dropped connections).
//!
//! ## Features
//!
//! - **Per-bucket admission** with FIFO waiters, single-flight resets and cancel-safe waits
//! - **Bucket hash discovery**: state migrates when the server reveals or changes a route's bucket
//! - **Global gate** shared by every route of a session
//! - **Bounded retries** with configurable backoff and jitter
//! - **Wait ceiling**: any wait longer than configured fails fast with [`HttpError::RateLimited`]
//! - **Challenge solving** through a pluggable [`ChallengeSolver`]
//! - **Telemetry** as [`EngineEvent`]s delivered to `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sluice::{Method, RequestOptions, Route, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::builder().user_agent("my-bot/1.0").build()?;
//!     let session = Session::builder(config).token("secret").build()?;
//!
//!     let route = Route::builder(Method::POST, "/channels/{channel_id}/messages")
//!         .param("channel_id", 1234)
//!         .build()?;
//!     let options = RequestOptions::new().json(&serde_json::json!({"content": "hello"}))?;
//!     let message = session.request(&route, options).await?;
//!     println!("{message}");
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bucket;
pub mod challenge;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod headers;
pub mod jitter;
pub mod registry;
pub mod response;
pub mod route;
pub mod session;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use bucket::{Bucket, BucketSettings, BucketSnapshot, Permit};
pub use challenge::{Challenge, ChallengeSolution, ChallengeSolver};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{RequestOptions, SessionConfig, SessionConfigBuilder};
pub use error::{BoxError, ConfigError, HttpError, HttpFailure, RouteError};
pub use gate::{GateGuard, GlobalGate};
pub use headers::RateLimitHeaders;
pub use http::Method;
pub use jitter::Jitter;
pub use registry::BucketRegistry;
pub use response::ResponseBody;
pub use route::{Route, RouteBuilder};
pub use session::{Session, SessionBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{
    BucketEvent, EngineEvent, GateEvent, LimitScope, LogSink, MemorySink, NullSink,
    RateLimitEvent, RequestOutcome, RetryEvent, RetryReason, TelemetrySink,
};
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
pub use transport::{
    OutboundRequest, Transport, TransportError, TransportErrorKind, TransportResponse,
};
