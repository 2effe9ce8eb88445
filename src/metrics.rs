//! Reconcile metrics
//!
//! Counters and durations live in a registry owned by the provider rather
//! than the process-wide default one, and are served by the metrics server.

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Result label values
pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";

/// Reconcile counters and duration histogram
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new(
                "talos_provider_reconcile_total",
                "Actuator invocations by resource, action and result",
            ),
            &["resource", "action", "result"],
        )
        .map_err(metrics_error)?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "talos_provider_reconcile_duration_seconds",
                "Duration of actuator invocations",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["resource"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(reconciles.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            reconciles,
            duration,
        })
    }

    /// Record one actuator invocation
    pub fn observe(&self, resource: &str, action: &str, succeeded: bool, elapsed: Duration) {
        let result = if succeeded { RESULT_SUCCESS } else { RESULT_ERROR };
        self.reconciles
            .with_label_values(&[resource, action, result])
            .inc();
        self.duration
            .with_label_values(&[resource])
            .observe(elapsed.as_secs_f64());
    }

    pub fn reconcile_count(&self, resource: &str, action: &str, result: &str) -> u64 {
        self.reconciles
            .with_label_values(&[resource, action, result])
            .get()
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics.observe("cluster", "reconcile", true, Duration::from_millis(250));
        metrics.observe("cluster", "reconcile", false, Duration::from_secs(2));
        metrics.observe("machine", "create", true, Duration::from_secs(40));

        assert_eq!(metrics.reconcile_count("cluster", "reconcile", RESULT_SUCCESS), 1);
        assert_eq!(metrics.reconcile_count("cluster", "reconcile", RESULT_ERROR), 1);

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("# TYPE talos_provider_reconcile_total counter"));
        assert!(text.contains("talos_provider_reconcile_duration_seconds_count{resource=\"cluster\"} 2"));
    }
}
