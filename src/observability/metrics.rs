//! Metrics collection and exposition.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize metrics exporter and server.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("Metrics server listening on http://{}", addr);
}

/// Record the outcome of a dispatched request.
pub fn record_dispatch(backend: &'static str, success: bool, az: &str, duration: Duration) {
    let labels = [
        ("backend", backend.to_string()),
        ("outcome", if success { "success" } else { "failure" }.to_string()),
        ("az", az.to_string()),
    ];
    counter!("proxy_dispatch_total", &labels).increment(1);
    histogram!("proxy_dispatch_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Record a request shed by a throttle rule or the throttling engine.
pub fn record_throttled() {
    counter!("proxy_throttled_total").increment(1);
}

/// Record a request answered by a deprecate rule.
pub fn record_deprecated() {
    counter!("proxy_deprecated_total").increment(1);
}

/// Record traffic for a HOB.
pub fn record_hob(hob: &str) {
    let hob = if hob.is_empty() { "unknown" } else { hob };
    counter!("proxy_hob_requests_total", "hob" => hob.to_string()).increment(1);
}
