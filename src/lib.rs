#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # routeguard
//!
//! Resilience and concurrency control for message routing: what happens when processing an
//! exchange fails, when a route's consumer should stop taking work, and how producers and
//! consumers for endpoints are shared between concurrent route executions.
//!
//! ## Features
//!
//! - **Exception policies** matched against the failure's cause chain and type hierarchy
//! - **Error handlers** with computed redelivery backoff, optional asynchronous redelivery
//!   and a dead-letter fallback
//! - **Route policies**: a failure-rate circuit breaker and an inflight throttle that suspend
//!   and resume the route's consumer
//! - **Resource pools** for shareable (single) or per-use (multiple) producers and consumers,
//!   with deferred eviction
//! - **Telemetry** as structured events delivered to `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use routeguard::{
//!     processor_fn, DeliveryState, ErrorHandler, ExceptionType, Exchange, Failure,
//!     RedeliveryPolicy, TrackingSleeper,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let sleeper = Arc::new(TrackingSleeper::new());
//! let handler = ErrorHandler::builder(
//!     "orders",
//!     Arc::new(processor_fn(|_exchange: &mut Exchange| {
//!         Err(Failure::new(ExceptionType::new("IoException"), "connection reset"))
//!     })),
//! )
//! .redelivery_policy(
//!     RedeliveryPolicy::builder()
//!         .maximum_redeliveries(3)
//!         .redelivery_delay(Duration::from_millis(100))
//!         .use_exponential_back_off(true)
//!         .build()
//!         .unwrap(),
//! )
//! .sleeper(sleeper.clone())
//! .build()
//! .unwrap();
//!
//! let delivery = handler.process(Exchange::with_body("payload")).await;
//! assert_eq!(delivery.state, DeliveryState::Rethrown);
//! assert_eq!(
//!     sleeper.calls(),
//!     vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
//! );
//! # });
//! ```

pub mod adaptive;
pub mod cache;
pub mod clock;
pub mod endpoint;
pub mod error;
pub mod error_handler;
pub mod exception;
pub mod exception_policy;
pub mod exchange;
pub mod executor;
pub mod logging;
pub mod pool;
pub mod prelude;
pub mod processor;
pub mod redelivery;
pub mod registry;
pub mod route_policy;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use cache::{
    ConsumerCache, EndpointUtilizationStatistics, ProducerCache, ProducerCacheBuilder, SendHandle,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use endpoint::{Endpoint, PollingConsumer, PooledResource, Producer};
pub use error::{ConfigError, ConsumeError, LifecycleError, PoolError, ReferenceKind};
pub use error_handler::{
    Delivery, DeliveryState, ErrorHandler, ErrorHandlerBuilder, ErrorHandlerConstructor,
    ErrorHandlerContext, ErrorHandlerDefinition, ErrorHandlerFactory, ErrorHandlerKind,
    RedeliveryOptions,
};
pub use exception::{ExceptionType, Failure, REJECTED_EXECUTION};
pub use exception_policy::{
    DefaultExceptionPolicyResolver, ExceptionPolicies, ExceptionPolicy, ExceptionPolicyBuilder,
    ExceptionPolicyKey, ExceptionPolicyResolver, RedeliverySource,
};
pub use exchange::{Exchange, FailureInfo, Headers, HistoryEntry, Message};
pub use executor::{
    ExecutorManager, ScheduledExecutor, ScheduledTask, TokioScheduler, DEFAULT_REDELIVERY_EXECUTOR,
};
pub use logging::LoggingLevel;
pub use pool::{
    PollingConsumerFactory, ProducerFactory, ResourceFactory, ResourcePool, DEFAULT_CAPACITY,
    DEFAULT_MAX_ENDPOINTS,
};
pub use processor::{processor_fn, FnProcessor, Predicate, Processor, SharedProcessor};
pub use redelivery::{
    DelayPattern, RedeliveryPolicy, RedeliveryPolicyBuilder, UNLIMITED_REDELIVERIES,
};
pub use registry::Registry;
pub use route_policy::{
    resume_or_start, suspend_or_stop, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitBreakerRoutePolicy, CircuitBreakerRoutePolicyBuilder, CircuitState, ConsumerStatus,
    DefaultInflightRepository, HalfOpenHandler, InflightRepository, InflightThrottlePolicy,
    InflightThrottlePolicyBuilder, Route, RouteConsumer, RoutePolicy, ThrottleScope,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{EventNotifier, PolicyEvent};
