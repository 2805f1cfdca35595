use super::statistics::EndpointUtilizationStatistics;
use crate::endpoint::{Endpoint, PollingConsumer};
use crate::error::{ConsumeError, PoolError};
use crate::exchange::Exchange;
use crate::pool::{PollingConsumerFactory, ResourcePool, DEFAULT_CAPACITY, DEFAULT_MAX_ENDPOINTS};
use crate::telemetry::EventNotifier;
use std::sync::Arc;
use std::time::Duration;

struct ConsumerCacheInner {
    pool: ResourcePool<dyn PollingConsumer>,
    statistics: Option<EndpointUtilizationStatistics>,
}

/// Pooled access to polling consumers. Clones share the same pool.
#[derive(Clone)]
pub struct ConsumerCache {
    inner: Arc<ConsumerCacheInner>,
}

impl Default for ConsumerCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, false, EventNotifier::disabled())
    }
}

impl ConsumerCache {
    pub fn new(capacity: usize, extended_statistics: bool, notifier: EventNotifier) -> Self {
        let pool = ResourcePool::new(Arc::new(PollingConsumerFactory))
            .with_capacity(capacity)
            .with_max_endpoints(DEFAULT_MAX_ENDPOINTS)
            .with_notifier(notifier);
        Self {
            inner: Arc::new(ConsumerCacheInner {
                pool,
                statistics: extended_statistics
                    .then(|| EndpointUtilizationStatistics::new(DEFAULT_MAX_ENDPOINTS)),
            }),
        }
    }

    pub fn statistics(&self) -> Option<&EndpointUtilizationStatistics> {
        self.inner.statistics.as_ref()
    }

    pub fn pool(&self) -> &ResourcePool<dyn PollingConsumer> {
        &self.inner.pool
    }

    pub async fn acquire_polling_consumer(
        &self,
        endpoint: &dyn Endpoint,
    ) -> Result<Arc<dyn PollingConsumer>, PoolError> {
        if let Some(statistics) = &self.inner.statistics {
            statistics.on_hit(endpoint.uri());
        }
        self.inner.pool.acquire(endpoint).await
    }

    pub async fn release_polling_consumer(
        &self,
        endpoint: &dyn Endpoint,
        consumer: Arc<dyn PollingConsumer>,
    ) {
        self.inner.pool.release(endpoint, consumer).await;
    }

    /// Wait until an exchange arrives.
    pub async fn receive(&self, endpoint: &dyn Endpoint) -> Result<Option<Exchange>, ConsumeError> {
        self.receive_with(endpoint, None).await
    }

    /// Wait up to `timeout`; `Ok(None)` when nothing arrived in time.
    pub async fn receive_timeout(
        &self,
        endpoint: &dyn Endpoint,
        timeout: Duration,
    ) -> Result<Option<Exchange>, ConsumeError> {
        self.receive_with(endpoint, Some(timeout)).await
    }

    /// Poll without waiting.
    pub async fn receive_no_wait(
        &self,
        endpoint: &dyn Endpoint,
    ) -> Result<Option<Exchange>, ConsumeError> {
        self.receive_with(endpoint, Some(Duration::ZERO)).await
    }

    async fn receive_with(
        &self,
        endpoint: &dyn Endpoint,
        timeout: Option<Duration>,
    ) -> Result<Option<Exchange>, ConsumeError> {
        let consumer = self.acquire_polling_consumer(endpoint).await?;
        let received = consumer.receive(timeout).await;
        self.release_polling_consumer(endpoint, consumer).await;

        received.map_err(|source| {
            tracing::debug!(
                target: "routeguard::cache",
                endpoint = %endpoint.uri(),
                error = %source,
                "polling consumer failed"
            );
            ConsumeError::Receive { endpoint: endpoint.uri().to_string(), source }
        })
    }

    pub async fn stop(&self) {
        self.inner.pool.stop().await;
        if let Some(statistics) = &self.inner.statistics {
            statistics.clear();
        }
    }
}

impl std::fmt::Debug for ConsumerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerCache").field("pool", &self.inner.pool).finish()
    }
}
