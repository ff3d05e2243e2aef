//! Per-endpoint request accounting.
//!
//! Dispatch handlers record every proxied request here, per path and under
//! the aggregate "/" endpoint, so operators can watch success rates per
//! endpoint without a downstream metrics query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct EndpointStats {
    success: AtomicU64,
    failure: AtomicU64,
    total_micros: AtomicU64,
}

impl EndpointStats {
    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    /// Error rate over everything recorded so far, 0.0 when idle.
    pub fn error_rate(&self) -> f64 {
        let success = self.success_count() as f64;
        let failure = self.failure_count() as f64;
        if failure == 0.0 {
            return 0.0;
        }
        failure / (success + failure)
    }

    pub fn mean_duration(&self) -> Duration {
        let total = self.success_count() + self.failure_count();
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed) / total)
    }
}

/// Concurrent registry of endpoint statistics.
#[derive(Debug, Default)]
pub struct Stats {
    endpoints: DashMap<String, Arc<EndpointStats>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request against an endpoint.
    pub fn record(&self, endpoint: &str, success: bool, duration: Duration) {
        let stats = self
            .endpoints
            .entry(endpoint.to_string())
            .or_default()
            .clone();
        if success {
            stats.success.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failure.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .total_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn endpoint(&self, endpoint: &str) -> Option<Arc<EndpointStats>> {
        self.endpoints.get(endpoint).map(|e| e.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_rates() {
        let stats = Stats::new();
        for _ in 0..9 {
            stats.record("/v1/point", true, Duration::from_millis(10));
        }
        stats.record("/v1/point", false, Duration::from_millis(10));

        let ep = stats.endpoint("/v1/point").unwrap();
        assert_eq!(ep.success_count(), 9);
        assert_eq!(ep.failure_count(), 1);
        assert!((ep.error_rate() - 0.1).abs() < f64::EPSILON);
        assert_eq!(ep.mean_duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_unknown_endpoint() {
        let stats = Stats::new();
        assert!(stats.endpoint("/nope").is_none());
    }
}
