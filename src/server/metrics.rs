//! Prometheus metrics for the DataPlane operator
//!
//! Each operator owns its own `Registry` so tests can create independent
//! instances without colliding on the global default registry.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Reconcile latency buckets in seconds
const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: Histogram,
    promotions: IntCounter,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "dataplane_reconciliations_total",
                "DataPlane reconcile passes by result",
            ),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dataplane_reconcile_duration_seconds",
                "Time spent in a single DataPlane reconcile pass",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        let promotions = IntCounter::new(
            "dataplane_promotions_total",
            "Blue/green promotions that completed",
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(promotions.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            promotions,
        })
    }

    /// Count a reconcile pass; `result` is "success" or "error"
    pub fn record_reconciliation(&self, result: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.reconcile_duration.observe(duration_secs);
    }

    pub fn record_promotion(&self) {
        self.promotions.inc();
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<ControllerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
