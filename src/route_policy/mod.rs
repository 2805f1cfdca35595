//! Route policies: feedback controllers that watch exchange completions and start, stop,
//! suspend or resume the route's consumer.
//!
//! - [`CircuitBreakerRoutePolicy`] stops taking work after too many failures in a window and
//!   probes for recovery after a cool-down.
//! - [`InflightThrottlePolicy`] suspends the consumer while too many exchanges are in flight.
//!
//! Both act through [`suspend_or_stop`] and [`resume_or_start`], which are idempotent: asking
//! an already suspended consumer to suspend does nothing.

mod circuit_breaker;
mod inflight;
mod throttle;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerRoutePolicy,
    CircuitBreakerRoutePolicyBuilder, CircuitState, HalfOpenHandler, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_FAILURE_WINDOW, DEFAULT_HALF_OPEN_AFTER,
};
pub use inflight::{DefaultInflightRepository, InflightRepository};
pub use throttle::{
    InflightThrottlePolicy, InflightThrottlePolicyBuilder, ThrottleScope, DEFAULT_MAX_INFLIGHT,
    DEFAULT_RESUME_PERCENT,
};

use crate::error::LifecycleError;
use crate::exception::Failure;
use crate::exchange::Exchange;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a route's consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConsumerStatus {
    Started,
    Suspended,
    Stopped,
}

/// The consumer feeding a route.
#[async_trait]
pub trait RouteConsumer: Send + Sync + fmt::Debug {
    fn status(&self) -> ConsumerStatus;

    /// Consumers that cannot suspend are stopped and started instead.
    fn supports_suspension(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<(), Failure>;

    async fn stop(&self) -> Result<(), Failure>;

    async fn suspend(&self) -> Result<(), Failure>;

    async fn resume(&self) -> Result<(), Failure>;
}

/// A route as seen by its policies: an id and the consumer to control.
#[derive(Debug, Clone)]
pub struct Route {
    id: String,
    consumer: Arc<dyn RouteConsumer>,
}

impl Route {
    pub fn new(id: impl Into<String>, consumer: Arc<dyn RouteConsumer>) -> Self {
        Self { id: id.into(), consumer }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn consumer(&self) -> &Arc<dyn RouteConsumer> {
        &self.consumer
    }
}

/// Suspend the consumer, or stop it if it cannot suspend. Returns `Ok(false)` when it was
/// already suspended or stopped.
pub async fn suspend_or_stop(route: &Route) -> Result<bool, LifecycleError> {
    let consumer = route.consumer();
    if consumer.status() != ConsumerStatus::Started {
        return Ok(false);
    }
    let (operation, result) = if consumer.supports_suspension() {
        ("suspend", consumer.suspend().await)
    } else {
        ("stop", consumer.stop().await)
    };
    result.map_err(|source| LifecycleError { route_id: route.id().to_string(), operation, source })?;
    Ok(true)
}

/// Resume the consumer, or start it if it was stopped or cannot suspend. Returns `Ok(false)`
/// when it was already started.
pub async fn resume_or_start(route: &Route) -> Result<bool, LifecycleError> {
    let consumer = route.consumer();
    let (operation, result) = match consumer.status() {
        ConsumerStatus::Started => return Ok(false),
        ConsumerStatus::Suspended if consumer.supports_suspension() => {
            ("resume", consumer.resume().await)
        }
        ConsumerStatus::Suspended | ConsumerStatus::Stopped => ("start", consumer.start().await),
    };
    result.map_err(|source| LifecycleError { route_id: route.id().to_string(), operation, source })?;
    Ok(true)
}

/// Callbacks a route invokes on its policies.
#[async_trait]
pub trait RoutePolicy: Send + Sync {
    async fn on_init(&self, _route: &Route) {}

    async fn on_exchange_begin(&self, _route: &Route, _exchange: &Exchange) {}

    async fn on_exchange_done(&self, _route: &Route, _exchange: &Exchange) {}

    async fn on_stop(&self, _route: &Route) {}
}
