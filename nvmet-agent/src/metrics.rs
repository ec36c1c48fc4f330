//! Prometheus metrics for the nvmet-agent
//!
//! Provides metrics for monitoring reconcile runs and the daemon mutations
//! they issue.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total reconcile runs by kind and status
    pub const RECONCILES_TOTAL: &str = "nvmet_reconciles_total";
    /// Histogram: Duration of reconcile runs in seconds
    pub const RECONCILE_DURATION_SECONDS: &str = "nvmet_reconcile_duration_seconds";
    /// Counter: Daemon mutations by resource class and operation
    pub const MUTATIONS_TOTAL: &str = "nvmet_mutations_total";
    /// Gauge: 1 when the last full reconcile succeeded, 0 otherwise
    pub const CONVERGED: &str = "nvmet_converged";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a reconcile run with its result
pub fn record_reconcile(kind: &str, status: &str, duration_secs: f64) {
    counter!(names::RECONCILES_TOTAL, "kind" => kind.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::RECONCILE_DURATION_SECONDS, "kind" => kind.to_string())
        .record(duration_secs);
}

/// Record one add, update or delete issued against the daemon
pub fn record_mutation(resource: &str, operation: &str) {
    counter!(names::MUTATIONS_TOTAL, "resource" => resource.to_string(), "operation" => operation.to_string())
        .increment(1);
}

pub fn set_converged(converged: bool) {
    gauge!(names::CONVERGED).set(if converged { 1.0 } else { 0.0 });
}

/// Helper for timing reconcile runs
pub struct ReconcileTimer {
    kind: &'static str,
    start: Instant,
}

impl ReconcileTimer {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }

    /// Complete the run with success
    pub fn success(self) {
        record_reconcile(self.kind, "success", self.start.elapsed().as_secs_f64());
    }

    /// Complete the run with failure
    pub fn failure(self, status: &str) {
        record_reconcile(self.kind, status, self.start.elapsed().as_secs_f64());
    }
}
