use super::statistics::EndpointUtilizationStatistics;
use crate::endpoint::{Endpoint, Producer};
use crate::error::PoolError;
use crate::exchange::Exchange;
use crate::pool::{ProducerFactory, ResourcePool, DEFAULT_CAPACITY, DEFAULT_MAX_ENDPOINTS};
use crate::telemetry::{EventNotifier, ExchangeEvent, PolicyEvent};
use arc_swap::ArcSwapOption;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct LastProducer {
    uri: String,
    producer: Arc<dyn Producer>,
}

struct ProducerCacheInner {
    pool: ResourcePool<dyn Producer>,
    last: ArcSwapOption<LastProducer>,
    statistics: Option<EndpointUtilizationStatistics>,
    notifier: EventNotifier,
}

/// Pooled access to producers, with paired send notifications.
///
/// Clones share the same pool.
#[derive(Clone)]
pub struct ProducerCache {
    inner: Arc<ProducerCacheInner>,
}

/// Builder for [`ProducerCache`].
#[derive(Debug, Clone)]
pub struct ProducerCacheBuilder {
    capacity: usize,
    max_endpoints: usize,
    extended_statistics: bool,
    notifier: EventNotifier,
}

impl Default for ProducerCacheBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
            extended_statistics: false,
            notifier: EventNotifier::disabled(),
        }
    }
}

impl ProducerCacheBuilder {
    /// Idle producers kept per non-singleton endpoint.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn max_endpoints(mut self, max_endpoints: usize) -> Self {
        self.max_endpoints = max_endpoints;
        self
    }

    /// Track per-endpoint usage counts.
    pub fn extended_statistics(mut self, enabled: bool) -> Self {
        self.extended_statistics = enabled;
        self
    }

    pub fn notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> ProducerCache {
        let pool = ResourcePool::new(Arc::new(ProducerFactory))
            .with_capacity(self.capacity)
            .with_max_endpoints(self.max_endpoints)
            .with_notifier(self.notifier.clone());
        ProducerCache {
            inner: Arc::new(ProducerCacheInner {
                pool,
                last: ArcSwapOption::const_empty(),
                statistics: self
                    .extended_statistics
                    .then(|| EndpointUtilizationStatistics::new(self.max_endpoints)),
                notifier: self.notifier,
            }),
        }
    }
}

impl Default for ProducerCache {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ProducerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ProducerCacheBuilder {
        ProducerCacheBuilder::default()
    }

    /// Usage counters, if extended statistics are enabled.
    pub fn statistics(&self) -> Option<&EndpointUtilizationStatistics> {
        self.inner.statistics.as_ref()
    }

    pub fn pool(&self) -> &ResourcePool<dyn Producer> {
        &self.inner.pool
    }

    /// Producer for `endpoint`. Singleton endpoints hit the last-producer fast path when the
    /// URI is unchanged and the pool still holds that producer.
    pub async fn acquire_producer(
        &self,
        endpoint: &dyn Endpoint,
    ) -> Result<Arc<dyn Producer>, PoolError> {
        if let Some(statistics) = &self.inner.statistics {
            statistics.on_hit(endpoint.uri());
        }

        let singleton = endpoint.is_singleton_producer();
        if singleton {
            if let Some(last) = self.inner.last.load_full() {
                if last.uri == endpoint.uri() {
                    if self.inner.pool.holds(&last.uri, &last.producer) {
                        return Ok(Arc::clone(&last.producer));
                    }
                    self.forget(&last.producer);
                }
            }
        }

        let producer = self.inner.pool.acquire(endpoint).await?;
        if singleton {
            self.inner.last.store(Some(Arc::new(LastProducer {
                uri: endpoint.uri().to_string(),
                producer: Arc::clone(&producer),
            })));
        }
        Ok(producer)
    }

    pub async fn release_producer(&self, endpoint: &dyn Endpoint, producer: Arc<dyn Producer>) {
        self.inner.pool.release(endpoint, producer).await;
    }

    /// Evict a producer that failed beyond repair; it is never handed out again.
    pub async fn evict_producer(&self, endpoint: &dyn Endpoint, producer: &Arc<dyn Producer>) {
        self.forget(producer);
        self.inner.pool.evict(endpoint, producer).await;
    }

    fn forget(&self, producer: &Arc<dyn Producer>) {
        self.inner.last.rcu(|last| match last {
            Some(last) if Arc::ptr_eq(&last.producer, producer) => None,
            other => other.clone(),
        });
    }

    /// Send `exchange` to `endpoint`.
    ///
    /// A processing failure is recorded on the exchange, not returned; `Err` means no
    /// producer could be obtained. `Sending` and `Sent` events are always emitted in pairs.
    pub async fn send(&self, endpoint: &dyn Endpoint, exchange: &mut Exchange) -> Result<(), PoolError> {
        let producer = self.acquire_producer(endpoint).await?;
        let checkout = Checkout {
            pool: &self.inner.pool,
            uri: endpoint.uri(),
            singleton: endpoint.is_singleton_producer(),
            producer,
            returned: false,
        };
        exchange.set_to_endpoint(endpoint.uri());

        let watch = SendWatch::start(&self.inner.notifier, exchange.id(), endpoint.uri()).await;
        if let Err(failure) = checkout.producer.process(exchange).await {
            tracing::debug!(
                target: "routeguard::cache",
                endpoint = %endpoint.uri(),
                exchange_id = %exchange.id(),
                error = %failure,
                "producer failed"
            );
            exchange.set_exception(failure);
        }
        watch.finish(exchange.is_failed()).await;

        let producer = checkout.hand_back();
        self.release_producer(endpoint, producer).await;
        Ok(())
    }

    /// Send on a spawned task. `callback` runs once with the outcome before the handle
    /// resolves; if the task is aborted it runs with [`PoolError::Aborted`].
    pub fn send_async<F>(&self, endpoint: Arc<dyn Endpoint>, exchange: Exchange, callback: F) -> SendHandle
    where
        F: FnOnce(Result<&Exchange, &PoolError>) + Send + 'static,
    {
        let cache = self.clone();
        let uri = endpoint.uri().to_string();
        let completion = Completion { callback: Some(callback), endpoint: uri.clone() };
        let join = tokio::spawn(async move {
            let mut completion = completion;
            let mut exchange = exchange;
            match cache.send(endpoint.as_ref(), &mut exchange).await {
                Ok(()) => {
                    completion.complete(Ok(&exchange));
                    Ok(exchange)
                }
                Err(err) => {
                    completion.complete(Err(&err));
                    Err(err)
                }
            }
        });
        SendHandle { endpoint: uri, join }
    }

    /// Stop every pooled producer. Later sends fail with [`PoolError::Stopped`].
    pub async fn stop(&self) {
        self.inner.last.store(None);
        self.inner.pool.stop().await;
        if let Some(statistics) = &self.inner.statistics {
            statistics.clear();
        }
    }
}

impl std::fmt::Debug for ProducerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCache")
            .field("pool", &self.inner.pool)
            .field("statistics", &self.inner.statistics.is_some())
            .finish()
    }
}

/// Producer checked out for one send. Dropped without being handed back (the send was
/// cancelled mid-flight), a per-use producer is discarded; its state is unknown.
struct Checkout<'a> {
    pool: &'a ResourcePool<dyn Producer>,
    uri: &'a str,
    singleton: bool,
    producer: Arc<dyn Producer>,
    returned: bool,
}

impl Checkout<'_> {
    fn hand_back(mut self) -> Arc<dyn Producer> {
        self.returned = true;
        Arc::clone(&self.producer)
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if !self.returned && !self.singleton {
            tracing::debug!(target: "routeguard::cache", endpoint = %self.uri, "send cancelled, discarding producer");
            self.pool.discard(self.uri, Arc::clone(&self.producer));
        }
    }
}

/// Runs the `send_async` callback exactly once, with [`PoolError::Aborted`] if the task is
/// dropped first.
struct Completion<F>
where
    F: FnOnce(Result<&Exchange, &PoolError>),
{
    callback: Option<F>,
    endpoint: String,
}

impl<F> Completion<F>
where
    F: FnOnce(Result<&Exchange, &PoolError>),
{
    fn complete(&mut self, outcome: Result<&Exchange, &PoolError>) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl<F> Drop for Completion<F>
where
    F: FnOnce(Result<&Exchange, &PoolError>),
{
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            let aborted = PoolError::Aborted { endpoint: std::mem::take(&mut self.endpoint) };
            callback(Err(&aborted));
        }
    }
}

/// Completes the `Sending`/`Sent` pair. If the send is dropped mid-flight, `Sent` is still
/// emitted (marked failed) from the drop.
struct SendWatch {
    notifier: EventNotifier,
    exchange_id: String,
    endpoint: String,
    started: Instant,
    finished: bool,
}

impl SendWatch {
    async fn start(notifier: &EventNotifier, exchange_id: &str, endpoint: &str) -> Self {
        notifier
            .notify(PolicyEvent::Exchange(ExchangeEvent::Sending {
                exchange_id: exchange_id.to_string(),
                endpoint: endpoint.to_string(),
            }))
            .await;
        Self {
            notifier: notifier.clone(),
            exchange_id: exchange_id.to_string(),
            endpoint: endpoint.to_string(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn sent(&self, failed: bool) -> PolicyEvent {
        PolicyEvent::Exchange(ExchangeEvent::Sent {
            exchange_id: self.exchange_id.clone(),
            endpoint: self.endpoint.clone(),
            duration: self.started.elapsed(),
            failed,
        })
    }

    async fn finish(mut self, failed: bool) {
        self.finished = true;
        self.notifier.notify(self.sent(failed)).await;
    }
}

impl Drop for SendWatch {
    fn drop(&mut self) {
        if !self.finished {
            self.notifier.notify_detached(self.sent(true));
        }
    }
}

/// Completion handle returned by [`ProducerCache::send_async`].
///
/// Resolves to the exchange after the send (a processing failure is on the exchange), or to
/// [`PoolError::Aborted`] if the send task was cancelled or panicked.
#[pin_project]
#[derive(Debug)]
pub struct SendHandle {
    endpoint: String,
    #[pin]
    join: JoinHandle<Result<Exchange, PoolError>>,
}

impl SendHandle {
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Future for SendHandle {
    type Output = Result<Exchange, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.join.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(PoolError::Aborted { endpoint: this.endpoint.clone() }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
