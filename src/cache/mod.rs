//! Producer and consumer caches: façades over [`ResourcePool`](crate::pool::ResourcePool)
//! adding usage statistics, a last-producer fast path and paired send notifications.

mod consumer;
mod producer;
mod statistics;

pub use consumer::ConsumerCache;
pub use producer::{ProducerCache, ProducerCacheBuilder, SendHandle};
pub use statistics::EndpointUtilizationStatistics;
