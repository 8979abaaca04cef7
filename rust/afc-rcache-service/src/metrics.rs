// afc-rcache-service: Prometheus metrics

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Cache service counters and gauges, exposed on GET /metrics
pub struct ServiceMetrics {
    registry: Registry,
    pub updates: IntCounter,
    pub precomputations: IntCounter,
    pub invalidations: IntCounter,
    pub invalid_entries: IntGauge,
    pub precomputing_entries: IntGauge,
}

impl ServiceMetrics {
    pub fn new() -> ServiceMetrics {
        let registry = Registry::new();
        let updates =
            IntCounter::new("rcache_updates_total", "Cache rows written").unwrap();
        let precomputations = IntCounter::new(
            "rcache_precomputations_total",
            "Precomputation subtasks started",
        )
        .unwrap();
        let invalidations = IntCounter::new(
            "rcache_invalidation_requests_total",
            "Invalidation requests processed",
        )
        .unwrap();
        let invalid_entries =
            IntGauge::new("rcache_invalid_entries", "Rows currently Invalid").unwrap();
        let precomputing_entries = IntGauge::new(
            "rcache_precomputing_entries",
            "Rows currently Precomputing",
        )
        .unwrap();
        registry.register(Box::new(updates.clone())).unwrap();
        registry.register(Box::new(precomputations.clone())).unwrap();
        registry.register(Box::new(invalidations.clone())).unwrap();
        registry.register(Box::new(invalid_entries.clone())).unwrap();
        registry
            .register(Box::new(precomputing_entries.clone()))
            .unwrap();
        ServiceMetrics {
            registry,
            updates,
            precomputations,
            invalidations,
            invalid_entries,
            precomputing_entries,
        }
    }

    /// Prometheus text exposition
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
