//! Endpoint collaborator interfaces: the factories the resource pools draw from.

use crate::exception::Failure;
use crate::exchange::Exchange;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A resource with a lifecycle managed by a pool.
#[async_trait]
pub trait PooledResource: Send + Sync {
    async fn start(&self) -> Result<(), Failure> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), Failure> {
        Ok(())
    }
}

/// Sends exchanges to an endpoint.
#[async_trait]
pub trait Producer: PooledResource {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), Failure>;
}

/// Pulls exchanges from an endpoint.
#[async_trait]
pub trait PollingConsumer: PooledResource {
    /// Wait up to `timeout` for an exchange; `None` waits indefinitely and `Some(ZERO)` polls.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Exchange>, Failure>;
}

/// Creates producers and polling consumers for one URI.
#[async_trait]
pub trait Endpoint: Send + Sync + std::fmt::Debug {
    fn uri(&self) -> &str;

    /// The endpoint's producers are safe to share between concurrent callers.
    fn is_singleton_producer(&self) -> bool {
        false
    }

    /// The endpoint's polling consumers are safe to share between concurrent callers.
    fn is_singleton_consumer(&self) -> bool {
        false
    }

    async fn create_producer(&self) -> Result<Arc<dyn Producer>, Failure>;

    async fn create_polling_consumer(&self) -> Result<Arc<dyn PollingConsumer>, Failure>;
}
