//! Failure-rate circuit breaker acting on a route's consumer.
//!
//! Evaluated once per completed exchange, under a per-policy lock:
//!
//! - **Closed → Open** when at least `failure_threshold` failures were counted and the last
//!   one happened within `failure_window`. The consumer is suspended and a half-open timer is
//!   armed for `half_open_after`.
//! - **Open → HalfOpen** when the timer fires: the consumer is resumed so live traffic can
//!   probe. With a [`HalfOpenHandler`] the handler is asked instead, and the circuit goes
//!   straight to Closed or stays Open.
//! - **HalfOpen → Open** if, once the first exchange completed while half-open is counted,
//!   the failure threshold is still exceeded within `failure_window`; otherwise **Closed**,
//!   which resets all counters.
//!
//! Every transition cancels and replaces the half-open timer; a timer that fires after being
//! replaced sees a stale generation and does nothing.

use super::{resume_or_start, suspend_or_stop, Route, RoutePolicy};
use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::exception::ExceptionType;
use crate::exchange::Exchange;
use crate::executor::{ScheduledExecutor, ScheduledTask, TokioScheduler};
use crate::telemetry::{CircuitBreakerEvent, EventNotifier, PolicyEvent};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

pub const DEFAULT_FAILURE_THRESHOLD: u64 = 50;
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_HALF_OPEN_AFTER: Duration = Duration::from_secs(30);

/// Current state of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CircuitState {
    /// Consumer running; failures are counted.
    Closed,
    /// Consumer resumed to probe after a cool-down.
    HalfOpen,
    /// Consumer suspended.
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::HalfOpen => write!(f, "half-open"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Decides whether an open circuit may close, instead of probing with live traffic.
#[async_trait]
pub trait HalfOpenHandler: Send + Sync + fmt::Debug {
    async fn is_ready(&self, route: &Route) -> bool;
}

/// Validated circuit breaker settings.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: u64,
    failure_window: Duration,
    half_open_after: Duration,
    exceptions: Vec<ExceptionType>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            half_open_after: DEFAULT_HALF_OPEN_AFTER,
            exceptions: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    pub fn failure_threshold(&self) -> u64 {
        self.failure_threshold
    }

    pub fn failure_window(&self) -> Duration {
        self.failure_window
    }

    pub fn half_open_after(&self) -> Duration {
        self.half_open_after
    }

    /// Exception types that count as failures; empty counts every failure.
    pub fn exceptions(&self) -> &[ExceptionType] {
        &self.exceptions
    }

    fn counts(&self, exchange: &Exchange) -> bool {
        match exchange.exception() {
            None => false,
            Some(_) if self.exceptions.is_empty() => true,
            Some(failure) => self.exceptions.iter().any(|kind| failure.caused_by(kind)),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn failure_window(mut self, window: Duration) -> Self {
        self.config.failure_window = window;
        self
    }

    pub fn half_open_after(mut self, after: Duration) -> Self {
        self.config.half_open_after = after;
        self
    }

    /// Count only failures caused by `kind` (or a subtype). May be called repeatedly.
    pub fn exception(mut self, kind: ExceptionType) -> Self {
        self.config.exceptions.push(kind);
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        if self.config.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be > 0"));
        }
        if self.config.failure_window.is_zero() {
            return Err(ConfigError::invalid("failure_window", "must be > 0"));
        }
        if self.config.half_open_after.is_zero() {
            return Err(ConfigError::invalid("half_open_after", "must be > 0"));
        }
        Ok(self.config)
    }
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failures: u64,
    successes: u64,
    last_failure: Option<u64>,
    opened_at: Option<u64>,
    generation: u64,
    timer: Option<ScheduledTask>,
    route: Option<Route>,
}

impl Counters {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
            opened_at: None,
            generation: 0,
            timer: None,
            route: None,
        }
    }

    /// Bump the generation and cancel the pending timer.
    fn advance(&mut self) -> u64 {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.generation
    }
}

struct CircuitBreakerInner {
    config: CircuitBreakerConfig,
    keep_open: AtomicBool,
    counters: Mutex<Counters>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn ScheduledExecutor>,
    half_open_handler: Option<Arc<dyn HalfOpenHandler>>,
    notifier: EventNotifier,
}

/// Route policy suspending the consumer while the failure rate is too high.
///
/// Clones share the same circuit.
#[derive(Clone)]
pub struct CircuitBreakerRoutePolicy {
    inner: Arc<CircuitBreakerInner>,
}

impl CircuitBreakerRoutePolicy {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: CircuitBreakerConfig) -> CircuitBreakerRoutePolicyBuilder {
        CircuitBreakerRoutePolicyBuilder::new(config)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.counters.lock().await.state
    }

    pub async fn failures(&self) -> u64 {
        self.inner.counters.lock().await.failures
    }

    pub async fn successes(&self) -> u64 {
        self.inner.counters.lock().await.successes
    }

    /// Clock reading (milliseconds) when the circuit last opened, while it is not closed.
    pub async fn opened_at(&self) -> Option<u64> {
        self.inner.counters.lock().await.opened_at
    }

    pub fn is_keep_open(&self) -> bool {
        self.inner.keep_open.load(Ordering::Acquire)
    }

    /// Force the circuit open (and hold it) or release it. Releasing an open circuit arms
    /// the half-open timer.
    pub async fn set_keep_open(&self, keep_open: bool) {
        self.inner.keep_open.store(keep_open, Ordering::Release);
        let mut counters = self.inner.counters.lock().await;
        let Some(route) = counters.route.clone() else { return };
        if keep_open {
            if counters.state != CircuitState::Open {
                self.open(&route, &mut counters).await;
            }
        } else if counters.state == CircuitState::Open && counters.timer.is_none() {
            self.arm_half_open_timer(&mut counters);
        }
    }

    /// Close the circuit and reset its statistics.
    pub async fn close(&self) {
        let mut counters = self.inner.counters.lock().await;
        match counters.route.clone() {
            Some(route) => self.close_circuit(&route, &mut counters).await,
            None => {
                let generation = counters.advance();
                *counters = Counters::new();
                counters.generation = generation;
            }
        }
    }

    fn failure_limit_reached(&self, counters: &Counters, now: u64) -> bool {
        let config = &self.inner.config;
        if counters.failures < config.failure_threshold {
            return false;
        }
        let window_start = now.saturating_sub(millis(config.failure_window));
        counters.last_failure.is_some_and(|at| at >= window_start)
    }

    async fn open(&self, route: &Route, counters: &mut MutexGuard<'_, Counters>) {
        let previous = counters.state;
        counters.advance();
        counters.state = CircuitState::Open;
        counters.opened_at = Some(self.inner.clock.now_millis());

        if let Err(err) = suspend_or_stop(route).await {
            tracing::warn!(target: "routeguard::circuit_breaker", route_id = %route.id(), error = %err, "failed to suspend consumer");
        }
        if !self.is_keep_open() {
            self.arm_half_open_timer(counters);
        }
        if previous != CircuitState::Open {
            tracing::info!(
                target: "routeguard::circuit_breaker",
                route_id = %route.id(),
                from = %previous,
                failures = counters.failures,
                keep_open = self.is_keep_open(),
                "circuit opened"
            );
            self.inner
                .notifier
                .notify(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
                    route_id: route.id().to_string(),
                    failures: counters.failures,
                }))
                .await;
        }
    }

    async fn half_open(&self, route: &Route, counters: &mut MutexGuard<'_, Counters>) {
        counters.advance();
        counters.state = CircuitState::HalfOpen;
        if let Err(err) = resume_or_start(route).await {
            tracing::warn!(target: "routeguard::circuit_breaker", route_id = %route.id(), error = %err, "failed to resume consumer");
        }
        tracing::info!(target: "routeguard::circuit_breaker", route_id = %route.id(), "circuit half-open");
        self.inner
            .notifier
            .notify(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen {
                route_id: route.id().to_string(),
            }))
            .await;
    }

    async fn close_circuit(&self, route: &Route, counters: &mut MutexGuard<'_, Counters>) {
        let previous = counters.state;
        let generation = counters.advance();
        let kept_route = counters.route.take();
        **counters = Counters::new();
        counters.generation = generation;
        counters.route = kept_route;

        if let Err(err) = resume_or_start(route).await {
            tracing::warn!(target: "routeguard::circuit_breaker", route_id = %route.id(), error = %err, "failed to resume consumer");
        }
        if previous != CircuitState::Closed {
            tracing::info!(target: "routeguard::circuit_breaker", route_id = %route.id(), from = %previous, "circuit closed");
            self.inner
                .notifier
                .notify(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed {
                    route_id: route.id().to_string(),
                }))
                .await;
        }
    }

    fn arm_half_open_timer(&self, counters: &mut Counters) {
        let generation = counters.generation;
        let policy = self.clone();
        let task = self.inner.executor.schedule(
            self.inner.config.half_open_after,
            Box::pin(async move { policy.on_half_open_timer(generation).await }),
        );
        counters.timer = Some(task);
    }

    async fn on_half_open_timer(&self, generation: u64) {
        let mut counters = self.inner.counters.lock().await;
        if counters.generation != generation
            || counters.state != CircuitState::Open
            || self.is_keep_open()
        {
            tracing::trace!(target: "routeguard::circuit_breaker", generation, "stale half-open timer ignored");
            return;
        }
        counters.timer = None;
        let Some(route) = counters.route.clone() else { return };

        match &self.inner.half_open_handler {
            Some(handler) => {
                if handler.is_ready(&route).await {
                    self.close_circuit(&route, &mut counters).await;
                } else {
                    tracing::debug!(target: "routeguard::circuit_breaker", route_id = %route.id(), "half-open check failed, staying open");
                    self.open(&route, &mut counters).await;
                }
            }
            None => self.half_open(&route, &mut counters).await,
        }
    }
}

#[async_trait]
impl RoutePolicy for CircuitBreakerRoutePolicy {
    async fn on_init(&self, route: &Route) {
        let mut counters = self.inner.counters.lock().await;
        counters.route = Some(route.clone());
        if self.is_keep_open() {
            self.open(route, &mut counters).await;
        }
    }

    async fn on_exchange_done(&self, route: &Route, exchange: &Exchange) {
        let mut counters = self.inner.counters.lock().await;
        if counters.route.is_none() {
            counters.route = Some(route.clone());
        }

        if self.is_keep_open() {
            if counters.state != CircuitState::Open {
                self.open(route, &mut counters).await;
            } else if let Err(err) = suspend_or_stop(route).await {
                tracing::warn!(target: "routeguard::circuit_breaker", route_id = %route.id(), error = %err, "failed to suspend consumer");
            }
            return;
        }

        let now = self.inner.clock.now_millis();
        let counted = self.inner.config.counts(exchange);
        if counted {
            counters.failures += 1;
            counters.last_failure = Some(now);
        } else {
            counters.successes += 1;
        }

        match counters.state {
            CircuitState::Closed => {
                if self.failure_limit_reached(&counters, now) {
                    self.open(route, &mut counters).await;
                }
            }
            CircuitState::HalfOpen => {
                if self.failure_limit_reached(&counters, now) {
                    self.open(route, &mut counters).await;
                } else {
                    self.close_circuit(route, &mut counters).await;
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn on_stop(&self, route: &Route) {
        let mut counters = self.inner.counters.lock().await;
        counters.advance();
        tracing::debug!(target: "routeguard::circuit_breaker", route_id = %route.id(), "half-open timer cancelled");
    }
}

impl fmt::Debug for CircuitBreakerRoutePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRoutePolicy")
            .field("config", &self.inner.config)
            .field("keep_open", &self.is_keep_open())
            .field("executor", &self.inner.executor.name())
            .finish_non_exhaustive()
    }
}

/// Builder for [`CircuitBreakerRoutePolicy`]. Collaborators are fixed once built.
pub struct CircuitBreakerRoutePolicyBuilder {
    config: CircuitBreakerConfig,
    keep_open: bool,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn ScheduledExecutor>,
    half_open_handler: Option<Arc<dyn HalfOpenHandler>>,
    notifier: EventNotifier,
}

impl CircuitBreakerRoutePolicyBuilder {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            keep_open: false,
            clock: Arc::new(MonotonicClock::default()),
            executor: Arc::new(TokioScheduler::new("CircuitBreakerHalfOpenTask")),
            half_open_handler: None,
            notifier: EventNotifier::disabled(),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Executor for the half-open timer.
    pub fn executor(mut self, executor: Arc<dyn ScheduledExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn half_open_handler(mut self, handler: Arc<dyn HalfOpenHandler>) -> Self {
        self.half_open_handler = Some(handler);
        self
    }

    pub fn notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Start with the circuit held open; see [`CircuitBreakerRoutePolicy::set_keep_open`].
    pub fn keep_open(mut self, keep_open: bool) -> Self {
        self.keep_open = keep_open;
        self
    }

    pub fn build(self) -> CircuitBreakerRoutePolicy {
        CircuitBreakerRoutePolicy {
            inner: Arc::new(CircuitBreakerInner {
                config: self.config,
                keep_open: AtomicBool::new(self.keep_open),
                counters: Mutex::new(Counters::new()),
                clock: self.clock,
                executor: self.executor,
                half_open_handler: self.half_open_handler,
                notifier: self.notifier,
            }),
        }
    }
}

impl fmt::Debug for CircuitBreakerRoutePolicyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRoutePolicyBuilder")
            .field("config", &self.config)
            .field("keep_open", &self.keep_open)
            .field("executor", &self.executor.name())
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
