//! Inflight throttle: suspend the consumer while too many exchanges are in flight.
//!
//! The count is evaluated on every completion while the completing exchange is still
//! registered, so "101 in flight" means the completing exchange plus 100 others. Once the
//! count drops to the resume threshold (`max * resume_percent / 100`, at least 1) the
//! consumer is resumed.

use super::inflight::{DefaultInflightRepository, InflightRepository};
use super::{resume_or_start, suspend_or_stop, Route, RoutePolicy};
use crate::adaptive::DynamicConfig;
use crate::error::ConfigError;
use crate::exchange::Exchange;
use crate::logging::{log_at, LoggingLevel};
use crate::telemetry::{EventNotifier, PolicyEvent, ThrottleEvent};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_MAX_INFLIGHT: usize = 1000;
pub const DEFAULT_RESUME_PERCENT: u8 = 70;

/// Which exchanges count towards the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThrottleScope {
    /// Only exchanges of the policy's own route.
    #[default]
    Route,
    /// Every exchange known to the repository.
    Context,
}

struct ThrottleInner {
    max_inflight: DynamicConfig<usize>,
    resume_percent: u8,
    scope: ThrottleScope,
    logging_level: LoggingLevel,
    repository: Arc<dyn InflightRepository>,
    lock: Mutex<()>,
    notifier: EventNotifier,
}

/// Route policy keeping the number of inflight exchanges under a limit.
///
/// Clones share state. A limit of 0 disables suspension.
#[derive(Clone)]
pub struct InflightThrottlePolicy {
    inner: Arc<ThrottleInner>,
}

impl InflightThrottlePolicy {
    pub fn builder() -> InflightThrottlePolicyBuilder {
        InflightThrottlePolicyBuilder::default()
    }

    /// Live handle on the limit; updates apply to the next completion.
    pub fn max_inflight(&self) -> DynamicConfig<usize> {
        self.inner.max_inflight.clone()
    }

    pub fn max_inflight_exchanges(&self) -> usize {
        self.inner.max_inflight.value()
    }

    pub fn set_max_inflight_exchanges(&self, max: usize) {
        self.inner.max_inflight.set(max);
    }

    pub fn resume_percent_of_max(&self) -> u8 {
        self.inner.resume_percent
    }

    pub fn scope(&self) -> ThrottleScope {
        self.inner.scope
    }

    pub fn repository(&self) -> &Arc<dyn InflightRepository> {
        &self.inner.repository
    }

    /// Count at or below which a suspended consumer is resumed.
    pub fn resume_threshold(&self) -> usize {
        resume_threshold(self.max_inflight_exchanges(), self.inner.resume_percent)
    }

    fn inflight(&self, route: &Route) -> usize {
        match self.inner.scope {
            ThrottleScope::Route => self.inner.repository.size(route.id()),
            ThrottleScope::Context => self.inner.repository.total_size(),
        }
    }

    async fn throttle(&self, route: &Route) {
        let _guard = self.inner.lock.lock().await;
        let max = self.max_inflight_exchanges();
        let level = self.inner.logging_level;

        let size = self.inflight(route);
        if max > 0 && size > max {
            match suspend_or_stop(route).await {
                Ok(true) => {
                    log_at!(
                        level,
                        target: "routeguard::throttle",
                        route_id = %route.id(),
                        inflight = size,
                        max,
                        "throttling: suspending consumer"
                    );
                    self.inner
                        .notifier
                        .notify(PolicyEvent::Throttle(ThrottleEvent::Suspended {
                            route_id: route.id().to_string(),
                            inflight: size,
                            max,
                        }))
                        .await;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(target: "routeguard::throttle", route_id = %route.id(), error = %err, "failed to suspend consumer");
                }
            }
        }

        // Completions may have raced past while suspending.
        let size = self.inflight(route);
        let threshold = resume_threshold(max, self.inner.resume_percent);
        if size <= threshold {
            match resume_or_start(route).await {
                Ok(true) => {
                    log_at!(
                        level,
                        target: "routeguard::throttle",
                        route_id = %route.id(),
                        inflight = size,
                        threshold,
                        "throttling: resuming consumer"
                    );
                    self.inner
                        .notifier
                        .notify(PolicyEvent::Throttle(ThrottleEvent::Resumed {
                            route_id: route.id().to_string(),
                            inflight: size,
                            threshold,
                        }))
                        .await;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(target: "routeguard::throttle", route_id = %route.id(), error = %err, "failed to resume consumer");
                }
            }
        }
    }
}

impl Default for InflightThrottlePolicy {
    fn default() -> Self {
        InflightThrottlePolicyBuilder::default().assemble()
    }
}

#[async_trait]
impl RoutePolicy for InflightThrottlePolicy {
    async fn on_exchange_begin(&self, route: &Route, _exchange: &Exchange) {
        self.inner.repository.add(route.id());
    }

    async fn on_exchange_done(&self, route: &Route, _exchange: &Exchange) {
        self.throttle(route).await;
        self.inner.repository.remove(route.id());
    }
}

impl fmt::Debug for InflightThrottlePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightThrottlePolicy")
            .field("max_inflight", &self.max_inflight_exchanges())
            .field("resume_percent", &self.inner.resume_percent)
            .field("scope", &self.inner.scope)
            .field("logging_level", &self.inner.logging_level)
            .finish_non_exhaustive()
    }
}

/// Builder for [`InflightThrottlePolicy`].
#[derive(Debug)]
pub struct InflightThrottlePolicyBuilder {
    max_inflight: usize,
    resume_percent: u8,
    scope: ThrottleScope,
    logging_level: LoggingLevel,
    repository: Option<Arc<dyn InflightRepository>>,
    notifier: EventNotifier,
}

impl Default for InflightThrottlePolicyBuilder {
    fn default() -> Self {
        Self {
            max_inflight: DEFAULT_MAX_INFLIGHT,
            resume_percent: DEFAULT_RESUME_PERCENT,
            scope: ThrottleScope::Route,
            logging_level: LoggingLevel::Info,
            repository: None,
            notifier: EventNotifier::disabled(),
        }
    }
}

impl InflightThrottlePolicyBuilder {
    pub fn max_inflight_exchanges(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    pub fn resume_percent_of_max(mut self, percent: u8) -> Self {
        self.resume_percent = percent;
        self
    }

    pub fn scope(mut self, scope: ThrottleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn logging_level(mut self, level: LoggingLevel) -> Self {
        self.logging_level = level;
        self
    }

    /// Share an inflight repository, e.g. between the policies of several routes.
    pub fn repository(mut self, repository: Arc<dyn InflightRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Result<InflightThrottlePolicy, ConfigError> {
        if self.resume_percent > 100 {
            return Err(ConfigError::invalid(
                "resume_percent_of_max",
                format!("must be between 0 and 100, got {}", self.resume_percent),
            ));
        }
        Ok(self.assemble())
    }

    fn assemble(self) -> InflightThrottlePolicy {
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(DefaultInflightRepository::new()));
        InflightThrottlePolicy {
            inner: Arc::new(ThrottleInner {
                max_inflight: DynamicConfig::new(self.max_inflight),
                resume_percent: self.resume_percent,
                scope: self.scope,
                logging_level: self.logging_level,
                repository,
                lock: Mutex::new(()),
                notifier: self.notifier,
            }),
        }
    }
}

fn resume_threshold(max: usize, percent: u8) -> usize {
    let threshold = max.saturating_mul(usize::from(percent)) / 100;
    threshold.max(1)
}
