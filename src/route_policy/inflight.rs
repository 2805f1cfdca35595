use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts exchanges currently being processed, per route and in total.
pub trait InflightRepository: Send + Sync + fmt::Debug {
    fn add(&self, route_id: &str);

    fn remove(&self, route_id: &str);

    fn size(&self, route_id: &str) -> usize;

    fn total_size(&self) -> usize;
}

/// In-memory repository keyed by route id.
#[derive(Debug, Default)]
pub struct DefaultInflightRepository {
    routes: DashMap<String, usize>,
    total: AtomicUsize,
}

impl DefaultInflightRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InflightRepository for DefaultInflightRepository {
    fn add(&self, route_id: &str) {
        *self.routes.entry(route_id.to_string()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    fn remove(&self, route_id: &str) {
        let removed = match self.routes.get_mut(route_id) {
            Some(mut count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        };
        if removed {
            // Never underflows: only decremented after a matching add.
            self.total.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn size(&self, route_id: &str) -> usize {
        self.routes.get(route_id).map(|count| *count).unwrap_or(0)
    }

    fn total_size(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}
