//! Telemetry and observability for the request engine.
//!
//! The engine emits structured [`EngineEvent`]s at each decision point. Events flow through
//! `TelemetrySink` implementations which can log, collect, or forward them.
//!
//! # Event Types
//!
//! - **Bucket**: `HashDiscovered`, `HashChanged`, `Exhausted`
//! - **RateLimit**: `Hit`, `CeilingExceeded`
//! - **Retry**: `Attempt`, `Exhausted`
//! - **Gate**: `Closed`, `Reopened`
//! - **Request**: `Success`, `Failure`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait is a `tower::Service<EngineEvent>` for composability. Emission is
//! best-effort: sink errors never affect a request.

pub mod events;
pub mod sinks;

pub use events::{
    BucketEvent, EngineEvent, GateEvent, LimitScope, RateLimitEvent, RequestOutcome, RetryEvent,
    RetryReason,
};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
