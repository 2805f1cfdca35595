//! The error handler: redelivery state machine with an optional dead letter channel.
//!
//! An [`ErrorHandler`] wraps a route's output processor. When the output fails, the handler
//!
//! 1. resolves the best [`ExceptionPolicy`] for the failure and runs the
//!    `on_exception_occurred` hook,
//! 2. stops at once if the policy's `handled` predicate holds,
//! 3. otherwise redelivers while `retry_while` (or the redelivery policy's maximum) allows,
//!    waiting the computed delay on the calling task or handing the exchange to a
//!    [`ScheduledExecutor`] when delayed redelivery is asynchronous,
//! 4. once exhausted, continues past the failure if `continued` holds, runs the policy's
//!    outputs if it has any, dispatches to the dead letter endpoint if one is configured, or
//!    rethrows.
//!
//! Hook failures and dead letter dispatch failures are logged and discarded; they never
//! replace the original failure.
//!
//! ```rust
//! use routeguard::{
//!     processor_fn, DeliveryState, ErrorHandler, Exchange, ExceptionType, Failure,
//!     RedeliveryPolicy, TrackingSleeper,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let output = Arc::new(processor_fn(|_ex: &mut Exchange| {
//!     Err(Failure::new(ExceptionType::new("IoException"), "disk full"))
//! }));
//! let sleeper = TrackingSleeper::new();
//! let handler = ErrorHandler::builder("orders", output)
//!     .redelivery_policy(
//!         RedeliveryPolicy::builder()
//!             .maximum_redeliveries(2)
//!             .redelivery_delay(Duration::from_millis(10))
//!             .build()
//!             .unwrap(),
//!     )
//!     .sleeper(Arc::new(sleeper.clone()))
//!     .build()
//!     .unwrap();
//!
//! let delivery = handler.process(Exchange::with_body("payload")).await;
//! assert_eq!(delivery.state, DeliveryState::Rethrown);
//! assert_eq!(delivery.exchange.failure().redelivery_counter, 2);
//! assert_eq!(sleeper.call_count(), 2);
//! # });
//! ```

mod definition;

pub use definition::{
    ErrorHandlerConstructor, ErrorHandlerContext, ErrorHandlerDefinition, ErrorHandlerFactory,
    ErrorHandlerKind, RedeliveryOptions,
};

use crate::cache::ProducerCache;
use crate::endpoint::Endpoint;
use crate::error::{ConfigError, ReferenceKind};
use crate::exception::{ExceptionType, Failure};
use crate::exception_policy::{
    DefaultExceptionPolicyResolver, ExceptionPolicies, ExceptionPolicy, ExceptionPolicyResolver,
};
use crate::exchange::Exchange;
use crate::executor::{ScheduledExecutor, ScheduledTask, TokioScheduler, DEFAULT_REDELIVERY_EXECUTOR};
use crate::logging::log_at;
use crate::processor::{Predicate, SharedProcessor};
use crate::redelivery::RedeliveryPolicy;
use crate::registry::Registry;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{EventNotifier, PolicyEvent, RedeliveryEvent};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// How a delivery through the error handler ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// The output succeeded, possibly after redeliveries.
    Completed,
    /// The failure was handled by an exception policy; it does not propagate.
    Handled,
    /// The failure was ignored and routing continues as if it had not happened.
    Continued,
    /// Redeliveries were exhausted and the exchange went to the dead letter endpoint.
    DeadLettered,
    /// The failure propagates to the caller; the exchange still carries it.
    Rethrown,
}

impl DeliveryState {
    /// Only rethrown deliveries surface a failure to the caller.
    pub fn is_failure(self) -> bool {
        matches!(self, DeliveryState::Rethrown)
    }
}

/// Terminal result of [`ErrorHandler::process`].
#[derive(Debug)]
pub struct Delivery {
    pub exchange: Exchange,
    pub state: DeliveryState,
}

type DoneCallback = Box<dyn FnOnce(Delivery) + Send>;

struct PendingRedelivery {
    task: ScheduledTask,
    allow_while_stopping: bool,
}

struct ErrorHandlerInner {
    route_id: String,
    output: SharedProcessor,
    redelivery_policy: Arc<RedeliveryPolicy>,
    dead_letter: Option<Arc<dyn Endpoint>>,
    policies: ExceptionPolicies,
    resolver: Arc<dyn ExceptionPolicyResolver>,
    on_redelivery: Option<SharedProcessor>,
    on_exception_occurred: Option<SharedProcessor>,
    on_prepare_failure: Option<SharedProcessor>,
    retry_while: Option<Predicate>,
    use_original_message: bool,
    use_original_body: bool,
    capture_original: bool,
    sleeper: Arc<dyn Sleeper>,
    executor: Arc<dyn ScheduledExecutor>,
    producers: ProducerCache,
    notifier: EventNotifier,
    stopping: watch::Sender<bool>,
    pending: DashMap<String, PendingRedelivery>,
}

/// Error handler guarding one route's output. Clones share state.
#[derive(Clone)]
pub struct ErrorHandler {
    inner: Arc<ErrorHandlerInner>,
}

/// Redelivery bookkeeping for one exchange, carried across attempts.
struct RedeliveryState {
    attempts: u32,
    policy: Arc<RedeliveryPolicy>,
    exception_policy: Option<Arc<ExceptionPolicy>>,
    // Failure taken off the exchange while a redelivery is pending.
    failure: Option<Failure>,
    last_kind: Option<ExceptionType>,
}

enum Decision {
    Redeliver(Duration),
    Terminal(DeliveryState),
}

enum Step {
    Done(DeliveryState),
    Schedule(Duration),
}

/// Owns an exchange between entry and completion. Dropping it unfinished (a cancelled
/// redelivery task) abandons the exchange, so `done` always runs exactly once.
struct Continuation {
    handler: ErrorHandler,
    exchange: Option<Exchange>,
    state: RedeliveryState,
    done: Option<DoneCallback>,
}

impl Continuation {
    fn complete(&mut self, state: DeliveryState) {
        if let (Some(exchange), Some(done)) = (self.exchange.take(), self.done.take()) {
            done(Delivery { exchange, state });
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if let Some(mut exchange) = self.exchange.take() {
            self.handler.abandon(&mut exchange, &mut self.state);
            if let Some(done) = self.done.take() {
                done(Delivery { exchange, state: DeliveryState::Rethrown });
            }
        }
    }
}

impl ErrorHandler {
    pub fn builder(route_id: impl Into<String>, output: SharedProcessor) -> ErrorHandlerBuilder {
        ErrorHandlerBuilder::new(route_id.into(), output)
    }

    pub fn route_id(&self) -> &str {
        &self.inner.route_id
    }

    pub fn redelivery_policy(&self) -> &Arc<RedeliveryPolicy> {
        &self.inner.redelivery_policy
    }

    /// URI of the dead letter endpoint; `None` for the plain variant.
    pub fn dead_letter_uri(&self) -> Option<&str> {
        self.inner.dead_letter.as_deref().map(|e| e.uri())
    }

    pub fn exception_policies(&self) -> &ExceptionPolicies {
        &self.inner.policies
    }

    pub fn executor(&self) -> &Arc<dyn ScheduledExecutor> {
        &self.inner.executor
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.stopping.borrow()
    }

    /// Redeliveries currently waiting on the scheduled executor.
    pub fn pending_redeliveries(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn start(&self) {
        self.inner.stopping.send_replace(false);
        tracing::debug!(target: "routeguard::error_handler", route_id = %self.inner.route_id, "error handler started");
    }

    /// Mark the handler as stopping. Pending and future redeliveries whose policy does not
    /// allow redelivery while stopping are abandoned.
    pub fn stop(&self) {
        self.inner.stopping.send_replace(true);
        let abandoned: Vec<String> = self
            .inner
            .pending
            .iter()
            .filter(|entry| !entry.value().allow_while_stopping)
            .map(|entry| entry.key().clone())
            .collect();
        for exchange_id in abandoned {
            if let Some((_, pending)) = self.inner.pending.remove(&exchange_id) {
                if pending.task.cancel() {
                    tracing::debug!(
                        target: "routeguard::error_handler",
                        route_id = %self.inner.route_id,
                        exchange_id = %exchange_id,
                        "cancelled pending redelivery"
                    );
                }
            }
        }
        tracing::debug!(target: "routeguard::error_handler", route_id = %self.inner.route_id, "error handler stopping");
    }

    /// Drive `exchange` through the output until it reaches a terminal state.
    pub async fn process(&self, exchange: Exchange) -> Delivery {
        let fallback = exchange.clone();
        let (tx, rx) = oneshot::channel();
        self.process_with_callback(exchange, move |delivery| {
            let _ = tx.send(delivery);
        })
        .await;
        match rx.await {
            Ok(delivery) => delivery,
            Err(_) => self.lost(fallback),
        }
    }

    /// Delivery for an exchange whose continuation went away without completing, e.g. when
    /// the executor running its redelivery was shut down.
    fn lost(&self, mut exchange: Exchange) -> Delivery {
        tracing::warn!(
            target: "routeguard::error_handler",
            route_id = %self.inner.route_id,
            exchange_id = %exchange.id(),
            "exchange lost by the error handler, rethrowing"
        );
        let mut rejected = Failure::rejected(format!(
            "error handler for route '{}' dropped the exchange",
            self.inner.route_id
        ));
        if let Some(cause) = exchange.take_exception() {
            rejected = rejected.with_cause(cause);
        }
        exchange.set_exception(rejected);
        Delivery { exchange, state: DeliveryState::Rethrown }
    }

    /// Callback form of [`process`](Self::process). Returns `true` when the exchange finished
    /// on the calling task and `false` when it was handed to the scheduled executor for an
    /// asynchronous redelivery. `done` runs exactly once either way.
    pub async fn process_with_callback<F>(&self, exchange: Exchange, done: F) -> bool
    where
        F: FnOnce(Delivery) + Send + 'static,
    {
        let mut exchange = exchange;
        if exchange.route_id().is_none() {
            exchange.set_route_id(self.inner.route_id.clone());
        }
        if self.inner.capture_original {
            exchange.capture_original();
        }
        let continuation = Continuation {
            handler: self.clone(),
            exchange: Some(exchange),
            state: RedeliveryState {
                attempts: 0,
                policy: Arc::clone(&self.inner.redelivery_policy),
                exception_policy: None,
                failure: None,
                last_kind: None,
            },
            done: Some(Box::new(done)),
        };
        self.run(continuation).await
    }

    async fn run(&self, mut continuation: Continuation) -> bool {
        let step = match continuation.exchange.as_mut() {
            Some(exchange) => self.drive(exchange, &mut continuation.state).await,
            None => return true,
        };
        match step {
            Step::Done(state) => {
                continuation.complete(state);
                true
            }
            Step::Schedule(delay) => {
                self.schedule(continuation, delay);
                false
            }
        }
    }

    fn schedule(&self, continuation: Continuation, delay: Duration) {
        let Some(exchange_id) = continuation.exchange.as_ref().map(|e| e.id().to_string()) else {
            return;
        };
        let allow_while_stopping = continuation.state.policy.allow_redelivery_while_stopping();
        let handler = self.clone();
        let id = exchange_id.clone();
        let job: BoxFuture<'static, ()> = Box::pin(async move {
            handler.inner.pending.remove(&id);
            handler.resume(continuation).await;
        });

        let task = self.inner.executor.schedule(delay, job);
        self.inner
            .pending
            .insert(exchange_id.clone(), PendingRedelivery { task: task.clone(), allow_while_stopping });
        if task.has_fired() {
            self.inner.pending.remove(&exchange_id);
        }
        tracing::trace!(
            target: "routeguard::error_handler",
            route_id = %self.inner.route_id,
            exchange_id = %exchange_id,
            executor = %self.inner.executor.name(),
            delay_ms = delay.as_millis() as u64,
            "redelivery scheduled"
        );
    }

    async fn resume(&self, mut continuation: Continuation) {
        if self.is_stopping() && !continuation.state.policy.allow_redelivery_while_stopping() {
            if let Some(exchange) = continuation.exchange.as_mut() {
                self.abandon(exchange, &mut continuation.state);
            }
            continuation.complete(DeliveryState::Rethrown);
            return;
        }
        self.run(continuation).await;
    }

    async fn drive(&self, exchange: &mut Exchange, state: &mut RedeliveryState) -> Step {
        loop {
            if let Err(failure) = self.inner.output.process(exchange).await {
                exchange.set_exception(failure);
            }
            let Some(failure) = exchange.exception().cloned() else {
                if state.attempts > 0 {
                    tracing::debug!(
                        target: "routeguard::error_handler",
                        route_id = %self.inner.route_id,
                        exchange_id = %exchange.id(),
                        attempts = state.attempts,
                        "redelivery succeeded"
                    );
                }
                return Step::Done(DeliveryState::Completed);
            };

            match self.on_failure(exchange, state, failure).await {
                Decision::Terminal(outcome) => return Step::Done(outcome),
                Decision::Redeliver(delay) => {
                    let allow = state.policy.allow_redelivery_while_stopping();
                    if self.is_stopping() && !allow {
                        self.abandon(exchange, state);
                        return Step::Done(DeliveryState::Rethrown);
                    }
                    if state.policy.async_delayed_redelivery() && !delay.is_zero() {
                        return Step::Schedule(delay);
                    }
                    if !self.wait(delay, allow).await {
                        self.abandon(exchange, state);
                        return Step::Done(DeliveryState::Rethrown);
                    }
                }
            }
        }
    }

    /// Wait out a synchronous redelivery delay. Returns `false` if the handler started
    /// stopping and the redelivery must be abandoned.
    async fn wait(&self, delay: Duration, allow_while_stopping: bool) -> bool {
        let sleep = self.inner.sleeper.sleep(delay);
        if allow_while_stopping {
            sleep.await;
            return true;
        }
        let mut stopping = self.inner.stopping.subscribe();
        tokio::select! {
            _ = sleep => !self.is_stopping(),
            _ = stopping.wait_for(|stopping| *stopping) => false,
        }
    }

    async fn on_failure(
        &self,
        exchange: &mut Exchange,
        state: &mut RedeliveryState,
        failure: Failure,
    ) -> Decision {
        let exception_policy =
            self.inner.resolver.resolve(&self.inner.policies, exchange, &failure);
        state.policy = exception_policy
            .as_ref()
            .and_then(|p| p.redelivery_policy().cloned())
            .unwrap_or_else(|| Arc::clone(&self.inner.redelivery_policy));
        state.exception_policy = exception_policy.clone();

        if let Some(previous) = state.last_kind.replace(failure.kind().clone()) {
            if previous != *failure.kind() && state.policy.log_new_exception() {
                log_at!(
                    state.policy.retry_attempted_log_level(),
                    target: "routeguard::error_handler",
                    route_id = %self.inner.route_id,
                    exchange_id = %exchange.id(),
                    previous = %previous,
                    error = %failure,
                    "new exception occurred during redelivery"
                );
            }
        }

        let policy = exception_policy.as_deref();
        let hook = policy.and_then(|p| p.on_exception_occurred()).or(self.inner.on_exception_occurred.as_ref());
        self.run_hook("on_exception_occurred", hook.cloned(), exchange).await;

        if policy.and_then(|p| p.handled()).is_some_and(|handled| handled.matches(exchange)) {
            return Decision::Terminal(self.handle(exchange, state).await);
        }

        let retry_while = policy.and_then(|p| p.retry_while()).or(self.inner.retry_while.as_ref());
        let may_redeliver = match retry_while {
            Some(predicate) => predicate.matches(exchange),
            None => state.policy.allows_attempt(state.attempts),
        };
        if may_redeliver {
            return Decision::Redeliver(self.prepare_redelivery(exchange, state, &failure).await);
        }

        exchange.failure_mut().redelivery_exhausted = true;
        self.inner
            .notifier
            .notify(PolicyEvent::Redelivery(RedeliveryEvent::Exhausted {
                exchange_id: exchange.id().to_string(),
                attempts: state.attempts,
            }))
            .await;

        if policy.and_then(|p| p.continued()).is_some_and(|continued| continued.matches(exchange)) {
            return Decision::Terminal(self.continue_past(exchange, state).await);
        }
        Decision::Terminal(self.deliver_to_failure_processor(exchange, state, failure).await)
    }

    async fn prepare_redelivery(
        &self,
        exchange: &mut Exchange,
        state: &mut RedeliveryState,
        failure: &Failure,
    ) -> Duration {
        state.attempts += 1;
        let policy = Arc::clone(&state.policy);
        let info = exchange.failure_mut();
        info.redelivered = true;
        info.redelivery_counter = state.attempts;
        info.redelivery_max_counter = policy.maximum_redeliveries_bound();

        let delay = policy.delay_for(state.attempts);
        if policy.log_retry_attempted() && state.attempts % policy.retry_attempted_log_interval() == 0 {
            log_at!(
                policy.retry_attempted_log_level(),
                target: "routeguard::error_handler",
                route_id = %self.inner.route_id,
                exchange_id = %exchange.id(),
                attempt = state.attempts,
                max = ?policy.maximum_redeliveries_bound(),
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "redelivering"
            );
        }
        self.inner
            .notifier
            .notify(PolicyEvent::Redelivery(RedeliveryEvent::Attempt {
                exchange_id: exchange.id().to_string(),
                attempt: state.attempts,
                delay,
            }))
            .await;

        state.failure = exchange.take_exception();
        let hook = state
            .exception_policy
            .as_deref()
            .and_then(|p| p.on_redelivery())
            .or(self.inner.on_redelivery.as_ref())
            .cloned();
        self.run_hook("on_redelivery", hook, exchange).await;
        delay
    }

    async fn handle(&self, exchange: &mut Exchange, state: &RedeliveryState) -> DeliveryState {
        self.move_to_caught(exchange);
        exchange.failure_mut().handled = true;
        if let Some(outputs) = state.exception_policy.as_deref().and_then(|p| p.outputs()).cloned() {
            self.apply_original(exchange, state);
            self.run_hook("outputs", Some(outputs), exchange).await;
            exchange.failure_mut().error_handler_handled = true;
        }
        if state.policy.log_handled() {
            self.log_outcome(exchange, state, "failure handled");
        }
        self.inner
            .notifier
            .notify(PolicyEvent::Redelivery(RedeliveryEvent::Handled {
                exchange_id: exchange.id().to_string(),
            }))
            .await;
        DeliveryState::Handled
    }

    async fn continue_past(&self, exchange: &mut Exchange, state: &RedeliveryState) -> DeliveryState {
        self.move_to_caught(exchange);
        exchange.failure_mut().continued = true;
        if let Some(outputs) = state.exception_policy.as_deref().and_then(|p| p.outputs()).cloned() {
            self.run_hook("outputs", Some(outputs), exchange).await;
        }
        if state.policy.log_continued() {
            self.log_outcome(exchange, state, "failure ignored, continuing");
        }
        self.inner
            .notifier
            .notify(PolicyEvent::Redelivery(RedeliveryEvent::Continued {
                exchange_id: exchange.id().to_string(),
            }))
            .await;
        DeliveryState::Continued
    }

    async fn deliver_to_failure_processor(
        &self,
        exchange: &mut Exchange,
        state: &RedeliveryState,
        failure: Failure,
    ) -> DeliveryState {
        let outputs = state.exception_policy.as_deref().and_then(|p| p.outputs()).cloned();
        if let Some(outputs) = outputs {
            self.log_exhausted(exchange, state, &failure);
            self.move_to_caught(exchange);
            self.apply_original(exchange, state);
            self.run_hook("outputs", Some(outputs), exchange).await;
            exchange.failure_mut().error_handler_handled = true;
            if self.inner.dead_letter.is_some() {
                exchange.failure_mut().handled = true;
                return DeliveryState::Handled;
            }
            exchange.failure_mut().exception_caught = None;
            exchange.set_exception(failure);
            return DeliveryState::Rethrown;
        }

        match self.inner.dead_letter.clone() {
            Some(endpoint) => self.dead_letter(exchange, state, &failure, endpoint.as_ref()).await,
            None => {
                self.record_failure_location(exchange);
                self.log_exhausted(exchange, state, &failure);
                DeliveryState::Rethrown
            }
        }
    }

    async fn dead_letter(
        &self,
        exchange: &mut Exchange,
        state: &RedeliveryState,
        failure: &Failure,
        endpoint: &dyn Endpoint,
    ) -> DeliveryState {
        let hook = state
            .exception_policy
            .as_deref()
            .and_then(|p| p.on_prepare_failure())
            .or(self.inner.on_prepare_failure.as_ref())
            .cloned();
        self.run_hook("on_prepare_failure", hook, exchange).await;

        self.log_exhausted(exchange, state, failure);
        self.move_to_caught(exchange);
        self.apply_original(exchange, state);
        let info = exchange.failure_mut();
        info.handled = true;
        info.error_handler_handled = true;
        exchange.record_history(self.inner.route_id.clone(), endpoint.uri());

        match self.inner.producers.send(endpoint, exchange).await {
            Ok(()) => {
                if let Some(dispatch_failure) = exchange.take_exception() {
                    tracing::warn!(
                        target: "routeguard::error_handler",
                        route_id = %self.inner.route_id,
                        exchange_id = %exchange.id(),
                        endpoint = %endpoint.uri(),
                        error = %dispatch_failure,
                        "dead letter endpoint failed, failure logged and ignored"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "routeguard::error_handler",
                    route_id = %self.inner.route_id,
                    exchange_id = %exchange.id(),
                    endpoint = %endpoint.uri(),
                    error = %err,
                    "could not send to dead letter endpoint, failure logged and ignored"
                );
            }
        }

        self.inner
            .notifier
            .notify(PolicyEvent::Redelivery(RedeliveryEvent::DeadLettered {
                exchange_id: exchange.id().to_string(),
                endpoint: endpoint.uri().to_string(),
            }))
            .await;
        DeliveryState::DeadLettered
    }

    /// Terminate a redelivery that may not run because the handler is stopping.
    fn abandon(&self, exchange: &mut Exchange, state: &mut RedeliveryState) {
        let original = state.failure.take().or_else(|| exchange.take_exception());
        let mut rejected = Failure::rejected(format!(
            "redelivery abandoned: error handler for route '{}' is stopping",
            self.inner.route_id
        ));
        if let Some(cause) = original {
            rejected = rejected.with_cause(cause);
        }
        tracing::warn!(
            target: "routeguard::error_handler",
            route_id = %self.inner.route_id,
            exchange_id = %exchange.id(),
            attempts = state.attempts,
            "redelivery abandoned while stopping"
        );
        exchange.set_exception(rejected);
        self.record_failure_location(exchange);
        self.inner.notifier.notify_detached(PolicyEvent::Redelivery(RedeliveryEvent::Abandoned {
            exchange_id: exchange.id().to_string(),
            attempts: state.attempts,
        }));
    }

    fn move_to_caught(&self, exchange: &mut Exchange) {
        self.record_failure_location(exchange);
        let caught = exchange.take_exception();
        exchange.failure_mut().exception_caught = caught;
    }

    fn record_failure_location(&self, exchange: &mut Exchange) {
        let endpoint = exchange.to_endpoint().map(str::to_string);
        let info = exchange.failure_mut();
        if info.failure_endpoint.is_none() {
            info.failure_endpoint = endpoint;
        }
        info.failure_route_id = Some(self.inner.route_id.clone());
    }

    fn apply_original(&self, exchange: &mut Exchange, state: &RedeliveryState) {
        let policy = state.exception_policy.as_deref();
        let use_message = policy.is_some_and(|p| p.use_original_message()) || self.inner.use_original_message;
        let use_body = policy.is_some_and(|p| p.use_original_body()) || self.inner.use_original_body;
        let Some(original) = exchange.original_message().cloned() else { return };
        if use_message {
            *exchange.message_mut() = original;
        } else if use_body {
            exchange.set_body(original.body);
        }
    }

    async fn run_hook(&self, hook_name: &'static str, hook: Option<SharedProcessor>, exchange: &mut Exchange) {
        let Some(hook) = hook else { return };
        if let Err(failure) = hook.process(exchange).await {
            tracing::warn!(
                target: "routeguard::error_handler",
                route_id = %self.inner.route_id,
                exchange_id = %exchange.id(),
                hook = hook_name,
                error = %failure,
                "error handler hook failed, ignoring"
            );
        }
    }

    fn log_exhausted(&self, exchange: &Exchange, state: &RedeliveryState, failure: &Failure) {
        if !state.policy.log_exhausted() {
            return;
        }
        let history = state.policy.log_exhausted_message_history().then(|| format_history(exchange));
        let body = state.policy.log_exhausted_message_body().then(|| exchange.body().to_string());
        log_at!(
            state.policy.retries_exhausted_log_level(),
            target: "routeguard::error_handler",
            route_id = %self.inner.route_id,
            exchange_id = %exchange.id(),
            attempts = state.attempts,
            error = %failure,
            history = ?history,
            body = ?body,
            "failed delivery, redeliveries exhausted"
        );
    }

    fn log_outcome(&self, exchange: &Exchange, state: &RedeliveryState, message: &'static str) {
        let caught = exchange.failure().exception_caught.as_ref().map(|f| f.to_string());
        log_at!(
            state.policy.retries_exhausted_log_level(),
            target: "routeguard::error_handler",
            route_id = %self.inner.route_id,
            exchange_id = %exchange.id(),
            attempts = state.attempts,
            error = ?caught,
            "{}",
            message
        );
    }
}

fn format_history(exchange: &Exchange) -> String {
    exchange
        .history()
        .iter()
        .map(|entry| format!("{}/{}", entry.route_id, entry.node))
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("route_id", &self.inner.route_id)
            .field("dead_letter", &self.dead_letter_uri())
            .field("redelivery_policy", &self.inner.redelivery_policy)
            .field("exception_policies", &self.inner.policies.len())
            .field("executor", &self.inner.executor.name())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

enum DeadLetterTarget {
    Endpoint(Arc<dyn Endpoint>),
    Uri(String),
}

/// Builder for [`ErrorHandler`]. References by name resolve against the registry at
/// [`build`](Self::build) time.
pub struct ErrorHandlerBuilder {
    route_id: String,
    output: SharedProcessor,
    redelivery_policy: Option<RedeliveryPolicy>,
    redelivery_policy_ref: Option<String>,
    dead_letter: Option<DeadLetterTarget>,
    policies: ExceptionPolicies,
    resolver: Arc<dyn ExceptionPolicyResolver>,
    on_redelivery: Option<SharedProcessor>,
    on_exception_occurred: Option<SharedProcessor>,
    on_prepare_failure: Option<SharedProcessor>,
    retry_while: Option<Predicate>,
    use_original_message: bool,
    use_original_body: bool,
    sleeper: Arc<dyn Sleeper>,
    executor: Option<Arc<dyn ScheduledExecutor>>,
    executor_ref: Option<String>,
    producers: Option<ProducerCache>,
    notifier: EventNotifier,
    registry: Option<Arc<Registry>>,
}

impl ErrorHandlerBuilder {
    fn new(route_id: String, output: SharedProcessor) -> Self {
        Self {
            route_id,
            output,
            redelivery_policy: None,
            redelivery_policy_ref: None,
            dead_letter: None,
            policies: ExceptionPolicies::new(),
            resolver: Arc::new(DefaultExceptionPolicyResolver),
            on_redelivery: None,
            on_exception_occurred: None,
            on_prepare_failure: None,
            retry_while: None,
            use_original_message: false,
            use_original_body: false,
            sleeper: Arc::new(TokioSleeper),
            executor: None,
            executor_ref: None,
            producers: None,
            notifier: EventNotifier::disabled(),
            registry: None,
        }
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery_policy = Some(policy);
        self
    }

    /// Use the redelivery policy registered under `name`.
    pub fn redelivery_policy_ref(mut self, name: impl Into<String>) -> Self {
        self.redelivery_policy_ref = Some(name.into());
        self
    }

    /// Dead letter channel variant: exhausted exchanges go to `endpoint`.
    pub fn dead_letter(mut self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.dead_letter = Some(DeadLetterTarget::Endpoint(endpoint));
        self
    }

    /// Dead letter endpoint looked up in the registry by URI.
    pub fn dead_letter_uri(mut self, uri: impl Into<String>) -> Self {
        self.dead_letter = Some(DeadLetterTarget::Uri(uri.into()));
        self
    }

    pub fn exception_policies(mut self, policies: ExceptionPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.policies.add(policy);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ExceptionPolicyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn on_redelivery(mut self, processor: SharedProcessor) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    pub fn on_exception_occurred(mut self, processor: SharedProcessor) -> Self {
        self.on_exception_occurred = Some(processor);
        self
    }

    pub fn on_prepare_failure(mut self, processor: SharedProcessor) -> Self {
        self.on_prepare_failure = Some(processor);
        self
    }

    pub fn retry_while(mut self, predicate: Predicate) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    pub fn use_original_message(mut self, enabled: bool) -> Self {
        self.use_original_message = enabled;
        self
    }

    pub fn use_original_body(mut self, enabled: bool) -> Self {
        self.use_original_body = enabled;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ScheduledExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use the executor registered under `name` for asynchronous redelivery.
    pub fn executor_ref(mut self, name: impl Into<String>) -> Self {
        self.executor_ref = Some(name.into());
        self
    }

    pub fn producer_cache(mut self, producers: ProducerCache) -> Self {
        self.producers = Some(producers);
        self
    }

    pub fn notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<ErrorHandler, ConfigError> {
        let empty = Registry::new();
        let registry: &Registry = self.registry.as_deref().unwrap_or(&empty);

        let redelivery_policy = match (self.redelivery_policy, self.redelivery_policy_ref) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::ConflictingRedeliveryPolicy { owner: self.route_id })
            }
            (Some(policy), None) => Arc::new(policy),
            (None, Some(name)) => registry.redelivery_policy(&name).ok_or(
                ConfigError::UnresolvedReference { kind: ReferenceKind::RedeliveryPolicy, name },
            )?,
            (None, None) => Arc::new(RedeliveryPolicy::default()),
        };

        let policies = self.policies.resolve_references(registry)?;

        let dead_letter = match self.dead_letter {
            Some(DeadLetterTarget::Endpoint(endpoint)) => Some(endpoint),
            Some(DeadLetterTarget::Uri(uri)) => Some(registry.endpoint(&uri)?),
            None => None,
        };

        let executor = match (self.executor, self.executor_ref) {
            (Some(executor), _) => executor,
            (None, Some(name)) => registry.executors().resolve(&name)?,
            (None, None) => match &self.registry {
                Some(registry) => registry.executors().get_or_create(DEFAULT_REDELIVERY_EXECUTOR),
                None => Arc::new(TokioScheduler::with_sleeper(
                    DEFAULT_REDELIVERY_EXECUTOR,
                    Arc::clone(&self.sleeper),
                )),
            },
        };

        let capture_original = self.use_original_message
            || self.use_original_body
            || policies.policies().iter().any(|p| p.use_original_message() || p.use_original_body());
        let producers = self
            .producers
            .unwrap_or_else(|| ProducerCache::builder().notifier(self.notifier.clone()).build());
        let (stopping, _) = watch::channel(false);

        tracing::debug!(
            target: "routeguard::error_handler",
            route_id = %self.route_id,
            dead_letter = ?dead_letter.as_deref().map(|e| e.uri()),
            exception_policies = policies.len(),
            "error handler built"
        );

        Ok(ErrorHandler {
            inner: Arc::new(ErrorHandlerInner {
                route_id: self.route_id,
                output: self.output,
                redelivery_policy,
                dead_letter,
                policies,
                resolver: self.resolver,
                on_redelivery: self.on_redelivery,
                on_exception_occurred: self.on_exception_occurred,
                on_prepare_failure: self.on_prepare_failure,
                retry_while: self.retry_while,
                use_original_message: self.use_original_message,
                use_original_body: self.use_original_body,
                capture_original,
                sleeper: self.sleeper,
                executor,
                producers,
                notifier: self.notifier,
                stopping,
                pending: DashMap::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn io() -> ExceptionType {
        ExceptionType::new("IoException")
    }

    fn failing(calls: &Arc<AtomicUsize>) -> SharedProcessor {
        let calls = Arc::clone(calls);
        Arc::new(processor_fn(move |_ex: &mut Exchange| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Failure::new(ExceptionType::new("IoException"), "disk full"))
        }))
    }

    fn fails_times(times: usize, calls: &Arc<AtomicUsize>) -> SharedProcessor {
        let calls = Arc::clone(calls);
        Arc::new(processor_fn(move |ex: &mut Exchange| {
            if calls.fetch_add(1, Ordering::SeqCst) < times {
                return Err(Failure::new(ExceptionType::new("IoException"), "flaky"));
            }
            ex.set_body(json!("done"));
            Ok(())
        }))
    }

    fn retries(max: i32) -> RedeliveryPolicy {
        RedeliveryPolicy::builder()
            .maximum_redeliveries(max)
            .redelivery_delay(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn success_completes_without_failure_metadata() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = ErrorHandler::builder("r", fails_times(0, &calls)).build().unwrap();

        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(delivery.state, DeliveryState::Completed);
        assert!(!delivery.exchange.failure().redelivered);
        assert_eq!(delivery.exchange.route_id(), Some("r"));
    }

    #[test]
    fn lost_exchange_is_rethrown_as_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = ErrorHandler::builder("r", failing(&calls)).build().unwrap();
        let mut exchange = Exchange::with_body(json!(1));
        exchange.set_exception(Failure::new(io(), "disk full"));

        let delivery = handler.lost(exchange);

        assert_eq!(delivery.state, DeliveryState::Rethrown);
        let failure = delivery.exchange.exception().unwrap();
        assert_eq!(failure.kind().name(), crate::exception::REJECTED_EXECUTION);
        assert_eq!(failure.cause().unwrap().kind().name(), "IoException");
    }

    #[tokio::test]
    async fn zero_redeliveries_rethrows_on_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sleeper = TrackingSleeper::new();
        let handler = ErrorHandler::builder("r", failing(&calls))
            .sleeper(Arc::new(sleeper.clone()))
            .build()
            .unwrap();

        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(delivery.state, DeliveryState::Rethrown);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sleeper.call_count(), 0);
        assert!(delivery.exchange.failure().redelivery_exhausted);
        assert_eq!(delivery.exchange.failure().failure_route_id.as_deref(), Some("r"));
        assert!(delivery.exchange.is_failed());
    }

    #[tokio::test]
    async fn redelivery_recovers_and_counts_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = ErrorHandler::builder("r", fails_times(2, &calls))
            .redelivery_policy(retries(5))
            .sleeper(Arc::new(InstantSleeper))
            .build()
            .unwrap();

        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(delivery.state, DeliveryState::Completed);
        assert_eq!(delivery.exchange.body(), &json!("done"));
        let info = delivery.exchange.failure();
        assert!(info.redelivered);
        assert_eq!(info.redelivery_counter, 2);
        assert_eq!(info.redelivery_max_counter, Some(5));
    }

    #[tokio::test]
    async fn handled_predicate_short_circuits_redelivery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sleeper = TrackingSleeper::new();
        let policy = ExceptionPolicy::builder(io())
            .handled(Predicate::constant(true))
            .redelivery_policy(retries(5))
            .build()
            .unwrap();
        let handler = ErrorHandler::builder("r", failing(&calls))
            .exception_policy(policy)
            .sleeper(Arc::new(sleeper.clone()))
            .build()
            .unwrap();

        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(delivery.state, DeliveryState::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sleeper.call_count(), 0);
        assert!(delivery.exchange.failure().handled);
        assert!(!delivery.exchange.is_failed());
        assert!(delivery.exchange.failure().exception_caught.is_some());
    }

    #[tokio::test]
    async fn continued_predicate_applies_after_exhaustion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = ExceptionPolicy::builder(io())
            .continued(Predicate::constant(true))
            .redelivery_policy(retries(2))
            .build()
            .unwrap();
        let handler = ErrorHandler::builder("r", failing(&calls))
            .exception_policy(policy)
            .sleeper(Arc::new(InstantSleeper))
            .build()
            .unwrap();

        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(delivery.state, DeliveryState::Continued);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(delivery.exchange.failure().continued);
        assert!(!delivery.exchange.is_failed());
    }

    #[tokio::test]
    async fn retry_while_overrides_maximum() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = ErrorHandler::builder("r", failing(&calls))
            .redelivery_policy(retries(0))
            .retry_while(Predicate::new(move |_| counter.load(Ordering::SeqCst) < 4))
            .sleeper(Arc::new(InstantSleeper))
            .build()
            .unwrap();

        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(delivery.state, DeliveryState::Rethrown);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failing_hooks_never_replace_the_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broken_hook: SharedProcessor = Arc::new(processor_fn(|_ex: &mut Exchange| {
            Err(Failure::new(ExceptionType::new("HookException"), "hook broke"))
        }));
        let handler = ErrorHandler::builder("r", failing(&calls))
            .redelivery_policy(retries(1))
            .on_exception_occurred(Arc::clone(&broken_hook))
            .on_redelivery(broken_hook)
            .sleeper(Arc::new(InstantSleeper))
            .build()
            .unwrap();

        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(delivery.state, DeliveryState::Rethrown);
        assert_eq!(delivery.exchange.exception().unwrap().kind().name(), "IoException");
    }

    #[tokio::test]
    async fn plain_handler_rethrows_after_policy_outputs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_outputs = Arc::clone(&seen);
        let policy = ExceptionPolicy::builder(io())
            .outputs(Arc::new(processor_fn(move |ex: &mut Exchange| {
                assert!(ex.failure().exception_caught.is_some());
                seen_in_outputs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .build()
            .unwrap();
        let handler = ErrorHandler::builder("r", failing(&calls)).exception_policy(policy).build().unwrap();

        let delivery = handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.state, DeliveryState::Rethrown);
        assert!(delivery.exchange.is_failed());
    }

    #[test]
    fn conflicting_policy_and_reference_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = ErrorHandler::builder("r", failing(&calls))
            .redelivery_policy(retries(1))
            .redelivery_policy_ref("shared")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ConflictingRedeliveryPolicy { owner: "r".into() });
    }

    #[test]
    fn unresolved_references_fail_at_build() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = ErrorHandler::builder("r", failing(&calls))
            .redelivery_policy_ref("missing")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnresolvedReference { kind: ReferenceKind::RedeliveryPolicy, .. }
        ));

        let err = ErrorHandler::builder("r", failing(&calls))
            .registry(Arc::new(Registry::new()))
            .executor_ref("redelivery-pool")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnresolvedReference { kind: ReferenceKind::ExecutorService, .. }
        ));

        let err = ErrorHandler::builder("r", failing(&calls))
            .dead_letter_uri("mock:dead")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedReference { kind: ReferenceKind::Endpoint, .. }));
    }

    #[tokio::test]
    async fn redelivery_policy_reference_resolves_from_registry() {
        let registry = Arc::new(Registry::new());
        registry.register_redelivery_policy("three", retries(3));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = ErrorHandler::builder("r", failing(&calls))
            .registry(Arc::clone(&registry))
            .redelivery_policy_ref("three")
            .sleeper(Arc::new(InstantSleeper))
            .build()
            .unwrap();

        assert_eq!(handler.redelivery_policy().maximum_redeliveries(), 3);
        handler.process(Exchange::with_body(json!(1))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn async_redelivery_hands_off_to_executor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RedeliveryPolicy::builder()
            .maximum_redeliveries(2)
            .redelivery_delay(Duration::from_millis(100))
            .async_delayed_redelivery(true)
            .build()
            .unwrap();
        let handler = ErrorHandler::builder("r", fails_times(1, &calls))
            .redelivery_policy(policy)
            .build()
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let sync = handler
            .process_with_callback(Exchange::with_body(json!(1)), move |delivery| {
                let _ = tx.send(delivery.state);
            })
            .await;
        assert!(!sync);
        assert_eq!(handler.pending_redeliveries(), 1);

        assert_eq!(rx.await.unwrap(), DeliveryState::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.pending_redeliveries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_abandons_pending_async_redelivery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RedeliveryPolicy::builder()
            .maximum_redeliveries(5)
            .redelivery_delay(Duration::from_secs(1))
            .async_delayed_redelivery(true)
            .allow_redelivery_while_stopping(false)
            .build()
            .unwrap();
        let handler = ErrorHandler::builder("r", failing(&calls))
            .redelivery_policy(policy)
            .build()
            .unwrap();

        let (tx, rx) = oneshot::channel();
        handler
            .process_with_callback(Exchange::with_body(json!(1)), move |delivery| {
                let _ = tx.send(delivery);
            })
            .await;
        handler.stop();

        let delivery = rx.await.unwrap();
        assert_eq!(delivery.state, DeliveryState::Rethrown);
        let failure = delivery.exchange.exception().unwrap();
        assert_eq!(failure.kind().name(), crate::exception::REJECTED_EXECUTION);
        assert_eq!(failure.cause().unwrap().kind().name(), "IoException");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_interrupts_synchronous_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RedeliveryPolicy::builder()
            .maximum_redeliveries(5)
            .redelivery_delay(Duration::from_secs(10))
            .allow_redelivery_while_stopping(false)
            .build()
            .unwrap();
        let handler = ErrorHandler::builder("r", failing(&calls))
            .redelivery_policy(policy)
            .build()
            .unwrap();

        let running = handler.clone();
        let delivery = tokio::spawn(async move { running.process(Exchange::with_body(json!(1))).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handler.stop();

        let delivery = delivery.await.unwrap();
        assert_eq!(delivery.state, DeliveryState::Rethrown);
        assert!(delivery.exchange.exception().unwrap().caused_by(&io()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
