//! Error types raised while building and running routeguard components.
//!
//! Processing failures inside a route are [`Failure`](crate::Failure) values carried on the
//! exchange; the types here cover everything else:
//!
//! - [`ConfigError`]: invalid or conflicting configuration, always raised at build time.
//! - [`PoolError`]: a producer or consumer could not be created or the pool is stopped.
//! - [`ConsumeError`]: a polling receive through the consumer cache failed.
//! - [`LifecycleError`]: a consumer rejected a start/stop/suspend/resume request.

use crate::exception::Failure;
use thiserror::Error;

/// Kind of named reference that can fail to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    RedeliveryPolicy,
    ExecutorService,
    Endpoint,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceKind::RedeliveryPolicy => write!(f, "redelivery policy"),
            ReferenceKind::ExecutorService => write!(f, "executor service"),
            ReferenceKind::Endpoint => write!(f, "endpoint"),
        }
    }
}

/// Fatal configuration errors. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Both an inline redelivery policy and a reference to a named one were configured.
    #[error("{owner}: redelivery policy and redelivery policy reference are mutually exclusive")]
    ConflictingRedeliveryPolicy { owner: String },
    /// A named reference did not resolve.
    #[error("no {kind} registered under '{name}'")]
    UnresolvedReference { kind: ReferenceKind, name: String },
    /// A value is outside its allowed range.
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    /// The delay pattern could not be parsed.
    #[error("invalid delay pattern '{pattern}': {reason}")]
    InvalidDelayPattern { pattern: String, reason: String },
    /// No constructor registered for the requested error handler kind.
    #[error("no error handler constructor registered for {0}")]
    UnknownErrorHandler(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

/// Errors from resource pools and the caches built on them.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The endpoint failed to create or start a resource. Not retried by the pool.
    #[error("failed to create resource for endpoint '{endpoint}': {source}")]
    Creation {
        endpoint: String,
        #[source]
        source: Failure,
    },
    /// The pool was stopped; no resources are handed out.
    #[error("resource pool is stopped")]
    Stopped,
    /// A spawned send was cancelled or panicked before completing.
    #[error("send to endpoint '{endpoint}' was aborted")]
    Aborted { endpoint: String },
}

impl PoolError {
    /// Check if this error is a creation failure.
    pub fn is_creation(&self) -> bool {
        matches!(self, Self::Creation { .. })
    }

    /// Endpoint URI the error relates to.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Creation { endpoint, .. } | Self::Aborted { endpoint } => Some(endpoint),
            Self::Stopped => None,
        }
    }
}

/// Errors from [`ConsumerCache`](crate::ConsumerCache) receives.
#[derive(Debug, Clone, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// The polling consumer failed while receiving.
    #[error("receive from '{endpoint}' failed: {source}")]
    Receive {
        endpoint: String,
        #[source]
        source: Failure,
    },
}

/// A consumer lifecycle operation failed.
#[derive(Debug, Clone, Error)]
#[error("route '{route_id}': failed to {operation} consumer: {source}")]
pub struct LifecycleError {
    pub route_id: String,
    pub operation: &'static str,
    #[source]
    pub source: Failure,
}
