use dashmap::DashMap;
use std::sync::Arc;

/// Per-endpoint usage counters kept when extended statistics are enabled.
///
/// Bounded: once `max_endpoints` URIs are tracked, hits on new URIs are not recorded.
#[derive(Debug, Clone)]
pub struct EndpointUtilizationStatistics {
    hits: Arc<DashMap<String, u64>>,
    max_endpoints: usize,
}

impl EndpointUtilizationStatistics {
    pub fn new(max_endpoints: usize) -> Self {
        Self { hits: Arc::new(DashMap::new()), max_endpoints: max_endpoints.max(1) }
    }

    pub fn on_hit(&self, uri: &str) {
        if let Some(mut count) = self.hits.get_mut(uri) {
            *count += 1;
            return;
        }
        if self.hits.len() >= self.max_endpoints {
            tracing::trace!(target: "routeguard::cache", endpoint = %uri, "statistics full, hit not recorded");
            return;
        }
        *self.hits.entry(uri.to_string()).or_insert(0) += 1;
    }

    pub fn hits(&self, uri: &str) -> u64 {
        self.hits.get(uri).map(|c| *c).unwrap_or(0)
    }

    /// Number of endpoints tracked.
    pub fn size(&self) -> usize {
        self.hits.len()
    }

    /// `(uri, hits)` pairs, most used first.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut all: Vec<(String, u64)> =
            self.hits.iter().map(|e| (e.key().clone(), *e.value())).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        all
    }

    pub fn clear(&self) {
        self.hits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_hits_per_endpoint() {
        let stats = EndpointUtilizationStatistics::new(10);
        stats.on_hit("mock:a");
        stats.on_hit("mock:a");
        stats.on_hit("mock:b");
        assert_eq!(stats.hits("mock:a"), 2);
        assert_eq!(stats.snapshot(), vec![("mock:a".to_string(), 2), ("mock:b".to_string(), 1)]);
    }

    #[test]
    fn stops_tracking_new_endpoints_when_full() {
        let stats = EndpointUtilizationStatistics::new(1);
        stats.on_hit("mock:a");
        stats.on_hit("mock:b");
        stats.on_hit("mock:a");
        assert_eq!(stats.size(), 1);
        assert_eq!(stats.hits("mock:a"), 2);
        assert_eq!(stats.hits("mock:b"), 0);
        stats.clear();
        assert_eq!(stats.size(), 0);
    }
}
