//! Prometheus metrics collection for nlad

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Counters shared by the capture source, manager and cluster API.
///
/// Cloning is cheap; every clone updates the same registered collectors.
#[derive(Clone)]
pub struct NladMetrics {
    // Capture
    pub capture_received_total: IntCounter,
    pub capture_skipped_total: IntCounter,
    pub capture_enobufs_total: IntCounter,

    // Manager
    pub dispatched_local_total: IntCounter,
    pub dispatched_api_total: IntCounter,
    pub service_failures_total: IntCounter,

    // Cluster API
    pub api_submitted_total: IntCounter,
    pub api_forward_dropped_total: IntCounter,
    pub api_subscribers_dropped_total: IntCounter,
    pub api_subscribers: IntGauge,
    pub api_slaves: IntGauge,

    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl NladMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        Ok(Self {
            capture_received_total: counter(
                &registry,
                "nlad_capture_received_total",
                "Kernel messages decoded into envelopes",
            )?,
            capture_skipped_total: counter(
                &registry,
                "nlad_capture_skipped_total",
                "Kernel messages skipped (unsupported or malformed)",
            )?,
            capture_enobufs_total: counter(
                &registry,
                "nlad_capture_enobufs_total",
                "Kernel socket overruns (ENOBUFS)",
            )?,
            dispatched_local_total: counter(
                &registry,
                "nlad_dispatched_local_total",
                "Envelopes dispatched from the local queue",
            )?,
            dispatched_api_total: counter(
                &registry,
                "nlad_dispatched_api_total",
                "Envelopes dispatched from the api queue",
            )?,
            service_failures_total: counter(
                &registry,
                "nlad_service_failures_total",
                "Service handler errors and panics",
            )?,
            api_submitted_total: counter(
                &registry,
                "nlad_api_submitted_total",
                "Envelopes submitted by slaves",
            )?,
            api_forward_dropped_total: counter(
                &registry,
                "nlad_api_forward_dropped_total",
                "Local envelopes not forwarded to the master",
            )?,
            api_subscribers_dropped_total: counter(
                &registry,
                "nlad_api_subscribers_dropped_total",
                "Subscribers disconnected for overflow",
            )?,
            api_subscribers: gauge(&registry, "nlad_api_subscribers", "Connected subscribers")?,
            api_slaves: gauge(&registry, "nlad_api_slaves", "Connected slaves")?,
            registry: Arc::new(registry),
        })
    }

    /// Text exposition of every registered collector.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = NladMetrics::new().unwrap();
        assert_eq!(metrics.capture_received_total.get(), 0);
        assert_eq!(metrics.api_subscribers.get(), 0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = NladMetrics::new().unwrap();
        let clone = metrics.clone();
        clone.service_failures_total.inc();
        clone.service_failures_total.inc();
        assert_eq!(metrics.service_failures_total.get(), 2);
    }

    #[test]
    fn test_render() {
        let metrics = NladMetrics::new().unwrap();
        metrics.dispatched_local_total.inc();
        let text = metrics.render();
        assert!(text.contains("nlad_dispatched_local_total 1"));
    }
}
