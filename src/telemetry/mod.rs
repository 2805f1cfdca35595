//! Telemetry for error handlers, route policies and resource pools.
//!
//! Components emit structured [`PolicyEvent`]s through an [`EventNotifier`]. A notifier wraps
//! any `tower::Service<PolicyEvent>` sink, so events can be logged, kept in memory for tests,
//! broadcast, or fanned out to several sinks.
//!
//! # Event Types
//!
//! - **Error handler**: `Attempt`, `Exhausted`, `Handled`, `Continued`, `DeadLettered`, `Abandoned`
//! - **Circuit breaker**: `Opened`, `HalfOpen`, `Closed`
//! - **Inflight throttle**: `Suspended`, `Resumed`
//! - **Pools**: `Created`, `Discarded`, `Evicted`
//! - **Producer cache**: paired `Sending` / `Sent`

pub mod events;
pub mod sinks;

pub use events::{
    event_to_json, CircuitBreakerEvent, ExchangeEvent, PolicyEvent, PoolEvent, RedeliveryEvent,
    ThrottleEvent,
};
pub use sinks::{
    emit_best_effort, ComposedSinkError, EventNotifier, LogSink, MemorySink, MulticastSink,
    NullSink, StreamingSink, TelemetrySink,
};
