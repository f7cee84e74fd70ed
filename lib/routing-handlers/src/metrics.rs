//! Prometheus metrics for the routing API

use anyhow::Result;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Counters shared by the handlers and background tasks
///
/// Clones share the same registry and counters.
#[derive(Clone)]
pub struct ApiMetrics {
    /// Requests rejected by the token middleware
    pub token_errors_total: IntCounter,
    /// Route entries removed by the expiry sweep
    pub route_sweeps_removed_total: IntCounter,
    pub registry: Arc<Registry>,
}

impl ApiMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let token_errors_total = IntCounter::new(
            "token_errors_total",
            "Total requests rejected for an invalid or missing token",
        )?;
        let route_sweeps_removed_total = IntCounter::new(
            "route_sweeps_removed_total",
            "Total expired route entries removed by the sweeper",
        )?;

        registry.register(Box::new(token_errors_total.clone()))?;
        registry.register(Box::new(route_sweeps_removed_total.clone()))?;

        Ok(Self {
            token_errors_total,
            route_sweeps_removed_total,
            registry,
        })
    }

    pub fn record_token_error(&self) {
        self.token_errors_total.inc();
    }

    pub fn record_swept(&self, removed: usize) {
        self.route_sweeps_removed_total.inc_by(removed as u64);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
