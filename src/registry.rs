//! Named components referenced from configuration: redelivery policies, endpoints and
//! scheduled executors.

use crate::endpoint::Endpoint;
use crate::error::{ConfigError, ReferenceKind};
use crate::executor::ExecutorManager;
use crate::redelivery::RedeliveryPolicy;
use crate::sleeper::Sleeper;
use dashmap::DashMap;
use std::sync::Arc;

/// Lookup table injected into the builders that resolve references by name.
#[derive(Debug, Default)]
pub struct Registry {
    redelivery_policies: DashMap<String, Arc<RedeliveryPolicy>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    executors: ExecutorManager,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose on-demand executors wait through `sleeper`.
    pub fn with_sleeper(sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            redelivery_policies: DashMap::new(),
            endpoints: DashMap::new(),
            executors: ExecutorManager::with_sleeper(sleeper),
        }
    }

    pub fn register_redelivery_policy(&self, name: impl Into<String>, policy: RedeliveryPolicy) {
        self.redelivery_policies.insert(name.into(), Arc::new(policy));
    }

    pub fn redelivery_policy(&self, name: &str) -> Option<Arc<RedeliveryPolicy>> {
        self.redelivery_policies.get(name).map(|p| Arc::clone(p.value()))
    }

    /// Register an endpoint under its URI.
    pub fn register_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.insert(endpoint.uri().to_string(), endpoint);
    }

    pub fn endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>, ConfigError> {
        self.endpoints.get(uri).map(|e| Arc::clone(e.value())).ok_or_else(|| {
            ConfigError::UnresolvedReference { kind: ReferenceKind::Endpoint, name: uri.to_string() }
        })
    }

    pub fn executors(&self) -> &ExecutorManager {
        &self.executors
    }
}
