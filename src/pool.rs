//! Per-endpoint resource pools for producers and polling consumers.
//!
//! A [`ResourcePool`] keeps one entry per endpoint URI in a sharded map, so endpoints never
//! contend with each other. Each entry uses one of two strategies, picked by the factory:
//!
//! - **Single** for resources safe to share: the first acquire creates the instance under a
//!   per-entry async lock; later acquires read it lock-free. Release is a no-op.
//! - **Multiple** for per-use resources: acquire takes an idle instance or creates a new one
//!   (never waits); release returns it to a bounded idle queue, or stops it when the queue is
//!   full.
//!
//! Eviction is two-phase. Evicting an instance or retiring an endpoint only marks it; the
//! actual `stop()` happens on the next acquire, release or [`ResourcePool::cleanup`] call, so a
//! stop never races with a concurrent acquire. An evicted instance is never handed out again.
//!
//! The number of endpoint entries is bounded too: when a new endpoint would exceed
//! `max_endpoints`, the least recently used entry is retired.

use crate::endpoint::{Endpoint, PollingConsumer, PooledResource, Producer};
use crate::error::PoolError;
use crate::exception::Failure;
use crate::telemetry::{EventNotifier, PolicyEvent, PoolEvent};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_MAX_ENDPOINTS: usize = 1000;

/// Creates pooled resources for an endpoint.
#[async_trait]
pub trait ResourceFactory<R: ?Sized + Send + Sync + 'static>: Send + Sync {
    async fn create(&self, endpoint: &dyn Endpoint) -> Result<Arc<R>, Failure>;

    /// Whether resources for this endpoint may be shared (Single strategy).
    fn is_singleton(&self, endpoint: &dyn Endpoint) -> bool;
}

/// Factory for [`Producer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerFactory;

#[async_trait]
impl ResourceFactory<dyn Producer> for ProducerFactory {
    async fn create(&self, endpoint: &dyn Endpoint) -> Result<Arc<dyn Producer>, Failure> {
        endpoint.create_producer().await
    }

    fn is_singleton(&self, endpoint: &dyn Endpoint) -> bool {
        endpoint.is_singleton_producer()
    }
}

/// Factory for [`PollingConsumer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingConsumerFactory;

#[async_trait]
impl ResourceFactory<dyn PollingConsumer> for PollingConsumerFactory {
    async fn create(&self, endpoint: &dyn Endpoint) -> Result<Arc<dyn PollingConsumer>, Failure> {
        endpoint.create_polling_consumer().await
    }

    fn is_singleton(&self, endpoint: &dyn Endpoint) -> bool {
        endpoint.is_singleton_consumer()
    }
}

struct SinglePool<R: ?Sized> {
    // arc-swap needs a sized pointee, hence the double Arc.
    instance: ArcSwapOption<Arc<R>>,
    init: tokio::sync::Mutex<()>,
}

impl<R: ?Sized> SinglePool<R> {
    fn new() -> Self {
        Self { instance: ArcSwapOption::const_empty(), init: tokio::sync::Mutex::new(()) }
    }

    fn current(&self) -> Option<Arc<R>> {
        self.instance.load().as_deref().cloned()
    }

    fn take(&self) -> Option<Arc<R>> {
        self.instance.swap(None).map(|slot| Arc::clone(slot.as_ref()))
    }
}

enum Released<R: ?Sized> {
    Idle,
    Doomed,
    Overflow(Arc<R>),
}

struct MultiplePool<R: ?Sized> {
    idle: Mutex<VecDeque<Arc<R>>>,
    // Evicted while checked out; moved to the teardown queue on release.
    doomed: Mutex<Vec<Arc<R>>>,
}

impl<R: ?Sized> MultiplePool<R> {
    fn new() -> Self {
        Self { idle: Mutex::new(VecDeque::new()), doomed: Mutex::new(Vec::new()) }
    }

    fn poll(&self) -> Option<Arc<R>> {
        self.idle.lock().pop_front()
    }

    fn offer(
        &self,
        uri: &str,
        resource: Arc<R>,
        capacity: usize,
        teardown: &Mutex<VecDeque<(String, Arc<R>)>>,
    ) -> Released<R> {
        let mut idle = self.idle.lock();
        let mut doomed = self.doomed.lock();
        if let Some(position) = doomed.iter().position(|d| Arc::ptr_eq(d, &resource)) {
            doomed.swap_remove(position);
            teardown.lock().push_back((uri.to_string(), resource));
            return Released::Doomed;
        }
        if idle.len() < capacity {
            idle.push_back(resource);
            Released::Idle
        } else {
            Released::Overflow(resource)
        }
    }

    fn evict(&self, uri: &str, resource: &Arc<R>, teardown: &Mutex<VecDeque<(String, Arc<R>)>>) {
        let mut idle = self.idle.lock();
        match idle.iter().position(|r| Arc::ptr_eq(r, resource)) {
            Some(position) => {
                if let Some(evicted) = idle.remove(position) {
                    teardown.lock().push_back((uri.to_string(), evicted));
                }
            }
            None => self.doomed.lock().push(Arc::clone(resource)),
        }
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

enum Strategy<R: ?Sized> {
    Single(SinglePool<R>),
    Multiple(MultiplePool<R>),
}

struct PoolEntry<R: ?Sized> {
    uri: String,
    last_used: AtomicU64,
    strategy: Strategy<R>,
}

impl<R: ?Sized> PoolEntry<R> {
    fn drain(&self) -> Vec<Arc<R>> {
        match &self.strategy {
            Strategy::Single(single) => single.take().into_iter().collect(),
            Strategy::Multiple(multiple) => multiple.idle.lock().drain(..).collect(),
        }
    }
}

/// Generic acquire/release pool keyed by endpoint URI.
pub struct ResourcePool<R: ?Sized + Send + Sync + 'static> {
    factory: Arc<dyn ResourceFactory<R>>,
    capacity: usize,
    max_endpoints: usize,
    entries: DashMap<String, Arc<PoolEntry<R>>>,
    retired: Mutex<Vec<Arc<PoolEntry<R>>>>,
    teardown: Mutex<VecDeque<(String, Arc<R>)>>,
    // Set whenever `retired` or `teardown` gain work, so clean calls skip both locks.
    pending: AtomicBool,
    ticks: AtomicU64,
    stopped: AtomicBool,
    notifier: EventNotifier,
}

impl<R> ResourcePool<R>
where
    R: PooledResource + ?Sized + Send + Sync + 'static,
{
    pub fn new(factory: Arc<dyn ResourceFactory<R>>) -> Self {
        Self {
            factory,
            capacity: DEFAULT_CAPACITY,
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
            entries: DashMap::new(),
            retired: Mutex::new(Vec::new()),
            teardown: Mutex::new(VecDeque::new()),
            pending: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            notifier: EventNotifier::disabled(),
        }
    }

    /// Maximum idle instances kept per Multiple entry (at least 1).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Maximum number of endpoint entries before the least recently used one is retired.
    pub fn with_max_endpoints(mut self, max_endpoints: usize) -> Self {
        self.max_endpoints = max_endpoints.max(1);
        self
    }

    pub fn with_notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of endpoint entries.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    /// Idle instances held for a Multiple entry (`0` for Single or unknown endpoints).
    pub fn idle_count(&self, uri: &str) -> usize {
        self.entries
            .get(uri)
            .map(|entry| match &entry.value().strategy {
                Strategy::Multiple(multiple) => multiple.idle_len(),
                Strategy::Single(_) => 0,
            })
            .unwrap_or(0)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Acquire a started resource for the endpoint.
    pub async fn acquire(&self, endpoint: &dyn Endpoint) -> Result<Arc<R>, PoolError> {
        self.cleanup().await;
        if self.is_stopped() {
            return Err(PoolError::Stopped);
        }

        let (entry, retired) = self.entry_for(endpoint);
        for uri in retired {
            self.notifier.notify(PolicyEvent::Pool(PoolEvent::Evicted { endpoint: uri })).await;
        }
        entry.last_used.store(self.ticks.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);

        match &entry.strategy {
            Strategy::Single(single) => {
                if let Some(resource) = single.current() {
                    return Ok(resource);
                }
                let _init = single.init.lock().await;
                if let Some(resource) = single.current() {
                    return Ok(resource);
                }
                let resource = self.create(endpoint).await?;
                single.instance.store(Some(Arc::new(Arc::clone(&resource))));
                Ok(resource)
            }
            Strategy::Multiple(multiple) => match multiple.poll() {
                Some(resource) => Ok(resource),
                None => self.create(endpoint).await,
            },
        }
    }

    /// Return a resource acquired for `endpoint`.
    pub async fn release(&self, endpoint: &dyn Endpoint, resource: Arc<R>) {
        self.cleanup().await;

        let entry = if self.is_stopped() {
            None
        } else {
            self.entries.get(endpoint.uri()).map(|e| Arc::clone(e.value()))
        };
        match entry {
            Some(entry) => match &entry.strategy {
                Strategy::Single(_) => {}
                Strategy::Multiple(multiple) => {
                    match multiple.offer(endpoint.uri(), resource, self.capacity, &self.teardown) {
                        Released::Idle => {}
                        Released::Doomed => {
                            self.mark_pending();
                            tracing::trace!(
                                target: "routeguard::pool",
                                endpoint = %endpoint.uri(),
                                "evicted resource released, queued for teardown"
                            );
                        }
                        Released::Overflow(extra) => {
                            tracing::debug!(
                                target: "routeguard::pool",
                                endpoint = %endpoint.uri(),
                                capacity = self.capacity,
                                "idle queue full, discarding resource"
                            );
                            self.stop_resource(endpoint.uri(), &extra).await;
                            self.notifier
                                .notify(PolicyEvent::Pool(PoolEvent::Discarded {
                                    endpoint: endpoint.uri().to_string(),
                                }))
                                .await;
                        }
                    }
                }
            },
            // Entry retired (or pool stopped) while the resource was checked out.
            None => {
                if !self.factory.is_singleton(endpoint) {
                    self.stop_resource(endpoint.uri(), &resource).await;
                }
            }
        }
    }

    /// Mark one resource for eviction. It is never handed out again and is stopped on the next
    /// pool-owning call.
    pub async fn evict(&self, endpoint: &dyn Endpoint, resource: &Arc<R>) {
        let entry = self.entries.get(endpoint.uri()).map(|e| Arc::clone(e.value()));
        let Some(entry) = entry else { return };
        match &entry.strategy {
            Strategy::Single(single) => {
                let is_current = single.current().is_some_and(|c| Arc::ptr_eq(&c, resource));
                if is_current {
                    if let Some(taken) = single.take() {
                        self.teardown.lock().push_back((entry.uri.clone(), taken));
                    }
                }
            }
            Strategy::Multiple(multiple) => multiple.evict(&entry.uri, resource, &self.teardown),
        }
        self.mark_pending();
        self.notifier
            .notify(PolicyEvent::Pool(PoolEvent::Evicted { endpoint: endpoint.uri().to_string() }))
            .await;
    }

    /// Retire a whole endpoint entry; its resources are stopped on the next pool-owning call.
    pub fn evict_endpoint(&self, uri: &str) -> bool {
        match self.entries.remove(uri) {
            Some((_, entry)) => {
                self.retired.lock().push(entry);
                self.mark_pending();
                true
            }
            None => false,
        }
    }

    /// Queue a checked-out resource for teardown instead of returning it, e.g. when the
    /// operation using it was cancelled and its state is unknown. Stopped on the next
    /// pool-owning call.
    pub fn discard(&self, uri: &str, resource: Arc<R>) {
        self.teardown.lock().push_back((uri.to_string(), resource));
        self.mark_pending();
    }

    /// Whether `resource` is the live shared instance of a Single entry for `uri`.
    pub fn holds(&self, uri: &str, resource: &Arc<R>) -> bool {
        self.entries.get(uri).is_some_and(|entry| match &entry.value().strategy {
            Strategy::Single(single) => single.current().is_some_and(|c| Arc::ptr_eq(&c, resource)),
            Strategy::Multiple(_) => false,
        })
    }

    /// Whether retired entries or evicted resources are waiting for [`cleanup`](Self::cleanup).
    pub fn has_pending_teardown(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop everything marked for eviction.
    pub async fn cleanup(&self) {
        if !self.pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let retired: Vec<Arc<PoolEntry<R>>> = std::mem::take(&mut *self.retired.lock());
        let mut pending: Vec<(String, Arc<R>)> = Vec::new();
        for entry in retired {
            pending.extend(entry.drain().into_iter().map(|r| (entry.uri.clone(), r)));
        }
        pending.extend(self.teardown.lock().drain(..));

        for (uri, resource) in pending {
            self.stop_resource(&uri, &resource).await;
        }
    }

    /// Stop the pool and every resource it still holds. Later acquires fail with
    /// [`PoolError::Stopped`].
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let uris: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for uri in uris {
            self.evict_endpoint(&uri);
        }
        self.cleanup().await;
    }

    fn entry_for(&self, endpoint: &dyn Endpoint) -> (Arc<PoolEntry<R>>, Vec<String>) {
        if let Some(entry) = self.entries.get(endpoint.uri()) {
            return (Arc::clone(entry.value()), Vec::new());
        }

        let mut inserted = false;
        let entry = Arc::clone(
            self.entries
                .entry(endpoint.uri().to_string())
                .or_insert_with(|| {
                    inserted = true;
                    let strategy = if self.factory.is_singleton(endpoint) {
                        Strategy::Single(SinglePool::new())
                    } else {
                        Strategy::Multiple(MultiplePool::new())
                    };
                    Arc::new(PoolEntry {
                        uri: endpoint.uri().to_string(),
                        last_used: AtomicU64::new(0),
                        strategy,
                    })
                })
                .value(),
        );

        let retired = if inserted { self.retire_least_recently_used(endpoint.uri()) } else { Vec::new() };
        (entry, retired)
    }

    fn retire_least_recently_used(&self, keep: &str) -> Vec<String> {
        let mut retired = Vec::new();
        while self.entries.len() > self.max_endpoints {
            let victim = self
                .entries
                .iter()
                .filter(|e| e.key() != keep)
                .min_by_key(|e| e.value().last_used.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            let Some(victim) = victim else { break };
            if self.evict_endpoint(&victim) {
                tracing::debug!(
                    target: "routeguard::pool",
                    endpoint = %victim,
                    max_endpoints = self.max_endpoints,
                    "retiring least recently used endpoint"
                );
                retired.push(victim);
            }
        }
        retired
    }

    async fn create(&self, endpoint: &dyn Endpoint) -> Result<Arc<R>, PoolError> {
        let resource = self.factory.create(endpoint).await.map_err(|source| {
            PoolError::Creation { endpoint: endpoint.uri().to_string(), source }
        })?;
        resource.start().await.map_err(|source| PoolError::Creation {
            endpoint: endpoint.uri().to_string(),
            source,
        })?;
        tracing::debug!(target: "routeguard::pool", endpoint = %endpoint.uri(), "resource created");
        self.notifier
            .notify(PolicyEvent::Pool(PoolEvent::Created { endpoint: endpoint.uri().to_string() }))
            .await;
        Ok(resource)
    }

    fn mark_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    async fn stop_resource(&self, uri: &str, resource: &Arc<R>) {
        if let Err(failure) = resource.stop().await {
            tracing::warn!(
                target: "routeguard::pool",
                endpoint = %uri,
                error = %failure,
                "failed to stop pooled resource"
            );
        }
    }
}

impl<R: ?Sized + Send + Sync + 'static> std::fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("capacity", &self.capacity)
            .field("max_endpoints", &self.max_endpoints)
            .field("endpoints", &self.entries.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::ExceptionType;
    use crate::exchange::Exchange;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct Counters {
        created: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct TestProducer {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl PooledResource for TestProducer {
        async fn stop(&self) -> Result<(), Failure> {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Producer for TestProducer {
        async fn process(&self, _exchange: &mut Exchange) -> Result<(), Failure> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct TestEndpoint {
        uri: String,
        singleton: bool,
        fail: bool,
        counters: Arc<Counters>,
    }

    impl TestEndpoint {
        fn new(uri: &str, singleton: bool) -> Arc<Self> {
            Arc::new(Self { uri: uri.into(), singleton, fail: false, counters: Arc::default() })
        }
    }

    #[async_trait]
    impl Endpoint for TestEndpoint {
        fn uri(&self) -> &str {
            &self.uri
        }

        fn is_singleton_producer(&self) -> bool {
            self.singleton
        }

        async fn create_producer(&self) -> Result<Arc<dyn Producer>, Failure> {
            if self.fail {
                return Err(Failure::new(ExceptionType::new("ConnectException"), "refused"));
            }
            tokio::task::yield_now().await;
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TestProducer { counters: Arc::clone(&self.counters) }))
        }

        async fn create_polling_consumer(&self) -> Result<Arc<dyn PollingConsumer>, Failure> {
            Err(Failure::new(ExceptionType::new("Unsupported"), "no consumers"))
        }
    }

    fn pool() -> ResourcePool<dyn Producer> {
        ResourcePool::new(Arc::new(ProducerFactory))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_pool_creates_once_under_concurrency() {
        let pool = Arc::new(pool());
        let endpoint = TestEndpoint::new("mock:shared", true);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move { pool.acquire(endpoint.as_ref()).await.unwrap() })
            })
            .collect();

        let mut producers = Vec::new();
        for handle in handles {
            producers.push(handle.await.unwrap());
        }
        assert_eq!(endpoint.counters.created.load(Ordering::SeqCst), 1);
        assert!(producers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn multiple_pool_discards_beyond_capacity() {
        let pool = pool().with_capacity(2);
        let endpoint = TestEndpoint::new("mock:per-use", false);

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire(endpoint.as_ref()).await.unwrap());
        }
        assert_eq!(endpoint.counters.created.load(Ordering::SeqCst), 3);

        for producer in held {
            pool.release(endpoint.as_ref(), producer).await;
        }
        assert_eq!(pool.idle_count("mock:per-use"), 2);
        assert_eq!(endpoint.counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multiple_pool_reuses_idle_instances() {
        let pool = pool();
        let endpoint = TestEndpoint::new("mock:per-use", false);
        let first = pool.acquire(endpoint.as_ref()).await.unwrap();
        pool.release(endpoint.as_ref(), Arc::clone(&first)).await;
        let second = pool.acquire(endpoint.as_ref()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(endpoint.counters.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn evicted_idle_instance_is_never_handed_out() {
        let pool = pool();
        let endpoint = TestEndpoint::new("mock:per-use", false);
        let first = pool.acquire(endpoint.as_ref()).await.unwrap();
        pool.release(endpoint.as_ref(), Arc::clone(&first)).await;

        pool.evict(endpoint.as_ref(), &first).await;
        assert_eq!(endpoint.counters.stopped.load(Ordering::SeqCst), 0, "stop is deferred");

        let next = pool.acquire(endpoint.as_ref()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &next));
        assert_eq!(endpoint.counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn evicted_in_use_instance_is_torn_down_after_release() {
        let pool = pool();
        let endpoint = TestEndpoint::new("mock:per-use", false);
        let producer = pool.acquire(endpoint.as_ref()).await.unwrap();

        pool.evict(endpoint.as_ref(), &producer).await;
        pool.release(endpoint.as_ref(), Arc::clone(&producer)).await;
        assert_eq!(pool.idle_count("mock:per-use"), 0);

        pool.cleanup().await;
        assert_eq!(endpoint.counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn least_recently_used_endpoint_is_retired() {
        let pool = pool().with_max_endpoints(2);
        let a = TestEndpoint::new("mock:a", true);
        let b = TestEndpoint::new("mock:b", true);
        let c = TestEndpoint::new("mock:c", true);

        pool.acquire(a.as_ref()).await.unwrap();
        pool.acquire(b.as_ref()).await.unwrap();
        pool.acquire(a.as_ref()).await.unwrap();
        pool.acquire(c.as_ref()).await.unwrap();

        assert!(pool.contains("mock:a"));
        assert!(!pool.contains("mock:b"));
        assert!(pool.contains("mock:c"));
        assert_eq!(b.counters.stopped.load(Ordering::SeqCst), 0, "stop is deferred");

        pool.cleanup().await;
        assert_eq!(b.counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn creation_failure_is_surfaced_with_endpoint() {
        let pool = pool();
        let endpoint = Arc::new(TestEndpoint {
            uri: "mock:down".into(),
            singleton: false,
            fail: true,
            counters: Arc::default(),
        });
        let err = pool.acquire(endpoint.as_ref()).await.err().unwrap();
        assert!(err.is_creation());
        assert_eq!(err.endpoint(), Some("mock:down"));
    }

    #[tokio::test]
    async fn stop_releases_everything_and_rejects_acquire() {
        let pool = pool();
        let single = TestEndpoint::new("mock:single", true);
        let multi = TestEndpoint::new("mock:multi", false);
        pool.acquire(single.as_ref()).await.unwrap();
        let m = pool.acquire(multi.as_ref()).await.unwrap();
        pool.release(multi.as_ref(), m).await;

        pool.stop().await;
        assert_eq!(single.counters.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(multi.counters.stopped.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire(single.as_ref()).await, Err(PoolError::Stopped)));
    }

    #[tokio::test]
    async fn cleanup_only_runs_when_work_is_pending() {
        let pool = pool();
        let endpoint = TestEndpoint::new("mock:per-use", false);
        let producer = pool.acquire(endpoint.as_ref()).await.unwrap();
        pool.release(endpoint.as_ref(), producer).await;
        assert!(!pool.has_pending_teardown());

        assert!(pool.evict_endpoint("mock:per-use"));
        assert!(pool.has_pending_teardown());
        pool.cleanup().await;
        assert!(!pool.has_pending_teardown());
        assert_eq!(endpoint.counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discarded_resource_is_stopped_on_next_call() {
        let pool = pool();
        let endpoint = TestEndpoint::new("mock:per-use", false);
        let producer = pool.acquire(endpoint.as_ref()).await.unwrap();

        pool.discard("mock:per-use", producer);
        assert_eq!(endpoint.counters.stopped.load(Ordering::SeqCst), 0);
        pool.acquire(endpoint.as_ref()).await.unwrap();
        assert_eq!(endpoint.counters.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count("mock:per-use"), 0);
    }

    #[tokio::test]
    async fn holds_tracks_the_live_single_instance() {
        let pool = pool();
        let endpoint = TestEndpoint::new("mock:single", true);
        let producer = pool.acquire(endpoint.as_ref()).await.unwrap();
        assert!(pool.holds("mock:single", &producer));

        pool.evict_endpoint("mock:single");
        assert!(!pool.holds("mock:single", &producer));
    }
}
