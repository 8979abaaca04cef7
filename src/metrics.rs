// afc-server: Prometheus counters

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Coordinator-side request counters, exposed on GET /metrics
pub struct Metrics {
    registry: Registry,
    pub requests: IntCounter,
    pub cache_hits: IntCounter,
    pub engine_dispatches: IntCounter,
    pub timeouts: IntCounter,
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();
        let requests = IntCounter::new(
            "afc_requests_total",
            "Spectrum inquiry messages received",
        )
        .unwrap();
        let cache_hits = IntCounter::new(
            "afc_cache_hits_total",
            "Sub-requests answered from the response cache",
        )
        .unwrap();
        let engine_dispatches = IntCounter::new(
            "afc_engine_dispatches_total",
            "Compute jobs submitted to engine workers",
        )
        .unwrap();
        let timeouts = IntCounter::new(
            "afc_request_timeouts_total",
            "Sub-requests failed on deadline",
        )
        .unwrap();
        for counter in [&requests, &cache_hits, &engine_dispatches, &timeouts] {
            registry.register(Box::new(counter.clone())).unwrap();
        }
        Metrics {
            registry,
            requests,
            cache_hits,
            engine_dispatches,
            timeouts,
        }
    }

    /// Prometheus text exposition of all counters
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
