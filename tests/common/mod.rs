#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use routeguard::{
    ConsumerStatus, Endpoint, ExceptionType, Exchange, Failure, PollingConsumer, PooledResource,
    Producer, RouteConsumer,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// Endpoint whose producers record every exchange they receive.
#[derive(Debug)]
pub struct MockEndpoint {
    uri: String,
    singleton: bool,
    fail_sends: bool,
    received: Arc<Mutex<Vec<Exchange>>>,
    queue: Arc<Mutex<VecDeque<Exchange>>>,
    created: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

impl MockEndpoint {
    pub fn new(uri: &str) -> Arc<Self> {
        Arc::new(Self::build(uri, false, false))
    }

    pub fn singleton(uri: &str) -> Arc<Self> {
        Arc::new(Self::build(uri, true, false))
    }

    /// Every send fails with a `ConnectException`.
    pub fn failing(uri: &str) -> Arc<Self> {
        Arc::new(Self::build(uri, false, true))
    }

    fn build(uri: &str, singleton: bool, fail_sends: bool) -> Self {
        Self {
            uri: uri.to_string(),
            singleton,
            fail_sends,
            received: Arc::new(Mutex::new(Vec::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            created: AtomicUsize::new(0),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn received(&self) -> Vec<Exchange> {
        self.received.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Queue an exchange for polling consumers.
    pub fn offer(&self, exchange: Exchange) {
        self.queue.lock().push_back(exchange);
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_singleton_producer(&self) -> bool {
        self.singleton
    }

    fn is_singleton_consumer(&self) -> bool {
        self.singleton
    }

    async fn create_producer(&self) -> Result<Arc<dyn Producer>, Failure> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockProducer {
            fail: self.fail_sends,
            received: Arc::clone(&self.received),
            stopped: Arc::clone(&self.stopped),
        }))
    }

    async fn create_polling_consumer(&self) -> Result<Arc<dyn PollingConsumer>, Failure> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPollingConsumer {
            queue: Arc::clone(&self.queue),
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

struct MockProducer {
    fail: bool,
    received: Arc<Mutex<Vec<Exchange>>>,
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl PooledResource for MockProducer {
    async fn stop(&self) -> Result<(), Failure> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Producer for MockProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), Failure> {
        if self.fail {
            return Err(Failure::new(ExceptionType::new("ConnectException"), "connection refused"));
        }
        self.received.lock().push(exchange.clone());
        Ok(())
    }
}

struct MockPollingConsumer {
    queue: Arc<Mutex<VecDeque<Exchange>>>,
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl PooledResource for MockPollingConsumer {
    async fn stop(&self) -> Result<(), Failure> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PollingConsumer for MockPollingConsumer {
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Exchange>, Failure> {
        if let Some(exchange) = self.queue.lock().pop_front() {
            return Ok(Some(exchange));
        }
        if let Some(timeout) = timeout {
            tokio::time::sleep(timeout).await;
        }
        Ok(self.queue.lock().pop_front())
    }
}

/// Route consumer that only tracks its status.
#[derive(Debug)]
pub struct TestConsumer {
    status: Mutex<ConsumerStatus>,
    transitions: Mutex<Vec<ConsumerStatus>>,
}

impl TestConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(ConsumerStatus::Started),
            transitions: Mutex::new(Vec::new()),
        })
    }

    pub fn transitions(&self) -> Vec<ConsumerStatus> {
        self.transitions.lock().clone()
    }

    fn set(&self, status: ConsumerStatus) -> Result<(), Failure> {
        *self.status.lock() = status;
        self.transitions.lock().push(status);
        Ok(())
    }
}

#[async_trait]
impl RouteConsumer for TestConsumer {
    fn status(&self) -> ConsumerStatus {
        *self.status.lock()
    }

    async fn start(&self) -> Result<(), Failure> {
        self.set(ConsumerStatus::Started)
    }

    async fn stop(&self) -> Result<(), Failure> {
        self.set(ConsumerStatus::Stopped)
    }

    async fn suspend(&self) -> Result<(), Failure> {
        self.set(ConsumerStatus::Suspended)
    }

    async fn resume(&self) -> Result<(), Failure> {
        self.set(ConsumerStatus::Started)
    }
}

#[derive(Clone)]
struct SharedWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture formatted log output on the current thread until the guard drops.
pub fn capture_logs() -> (tracing::subscriber::DefaultGuard, Arc<std::sync::Mutex<Vec<u8>>>) {
    let buffer = Arc::new(std::sync::Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_target(true)
        .without_time()
        .with_ansi(false)
        .finish();
    (tracing::subscriber::set_default(subscriber), buffer)
}

pub fn logs(buffer: &Arc<std::sync::Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
}
