//! API throttling.
//!
//! # Responsibilities
//! - Bucket inbound requests and record per-bucket request volume
//! - Reject requests that fall into buckets the throttling service flagged
//! - Periodically check in with the throttling service, fail-open on error
//!
//! # Design Decisions
//! - The hot path takes no locks: counters and the throttled set are read
//!   through atomic pointer loads, increments are atomic adds
//! - New bucket keys are added by copying the counter map and publishing via
//!   compare-and-swap; an increment racing the synchroniser's swap can be
//!   lost, which is accepted (bounded, very small)

pub mod checkin;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Response, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use tokio::sync::mpsc;

use crate::config::ConfigSource;
use crate::control::extractor::{Extractor, Features};
use crate::errors::ErrorBody;
use crate::http::buffer::BufferedBody;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::throttle::checkin::{BucketIncrement, CheckinClient};

/// How often the synchroniser checks in with the API throttling service.
const SYNCHRONISATION_INTERVAL: Duration = Duration::from_secs(5);
/// Initial capacity of each fresh counter buffer.
const DEFAULT_BUFFER_CAPACITY: usize = 5_000;
/// Capacity of the ingestion channel between request tasks and the ingester.
const INGEST_CAPACITY: usize = 500_000;

type CounterMap = HashMap<String, Arc<AtomicU64>>;
type ThrottledSet = HashSet<String>;

/// Per-session throttling, coordinated with a remote throttling service.
///
/// Buckets inbound requests, records statistics about request volume to each
/// bucket, and throttles full buckets. A throttled request proceeds no
/// further up the handler chain.
pub struct ThrottlingEngine {
    /// Inbound per-bucket request count buffer.
    counters: ArcSwap<CounterMap>,
    /// Buckets to throttle.
    throttled: ArcSwap<ThrottledSet>,
    /// Inbound bucket keys to be added to the buffer.
    ingest_tx: mpsc::Sender<String>,
    service_name: String,
}

impl ThrottlingEngine {
    /// Start the engine and its two background tasks (ingester and
    /// synchroniser). Both exit when the shutdown signal fires.
    pub fn new(
        client: Arc<dyn CheckinClient>,
        source: Arc<ConfigSource>,
        service_name: &str,
        shutdown: &Shutdown,
    ) -> Arc<Self> {
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CAPACITY);

        let engine = Arc::new(Self {
            counters: ArcSwap::from_pointee(CounterMap::with_capacity(DEFAULT_BUFFER_CAPACITY)),
            throttled: ArcSwap::from_pointee(ThrottledSet::new()),
            ingest_tx,
            service_name: service_name.to_string(),
        });

        let ingester = engine.clone();
        let mut shutdown_rx = shutdown.subscribe();
        shutdown.spawn("throttle-ingester", async move {
            ingester.ingester_worker(ingest_rx, &mut shutdown_rx).await;
        });

        let synchroniser = engine.clone();
        let mut shutdown_rx = shutdown.subscribe();
        shutdown.spawn("throttle-synchroniser", async move {
            synchroniser
                .synchroniser_worker(client, source, &mut shutdown_rx)
                .await;
        });

        engine
    }

    /// The buckets a request falls into: currently just the session bucket,
    /// when a session ID is present.
    pub fn buckets(&self, req: &Request<Body>) -> Vec<String> {
        let body = req
            .extensions()
            .get::<BufferedBody>()
            .map(|b| b.0.clone())
            .unwrap_or_default();
        let mut extractor = Extractor::new(
            req.method().clone(),
            req.uri().clone(),
            req.headers().clone(),
            body,
        );

        let session_id = extractor.value("session_id");
        if session_id.is_empty() {
            return Vec::new();
        }
        vec![format!("sessId:{session_id}")]
    }

    /// Queue bucket increments for the ingester. Never blocks: a full
    /// channel drops the increment.
    pub fn record(&self, buckets: &[String]) {
        for bucket in buckets {
            if self.ingest_tx.try_send(bucket.clone()).is_err() {
                tracing::warn!("Could not add bucket to ingestion buffer");
            }
        }
    }

    /// Checks if any of the passed buckets are to be throttled.
    pub fn any_throttled(&self, buckets: &[String]) -> bool {
        let throttled = self.throttled.load();
        buckets.iter().any(|b| throttled.contains(b))
    }

    /// The synthesised 429 response for a throttled request.
    pub fn throttled_response(&self) -> Response<Body> {
        let body = ErrorBody {
            status: false,
            payload: "Client error: rate limit exceeded".to_string(),
            code: 429,
            dotted_code: format!("{}.throttled", self.service_name),
            context: None,
        };
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::TOO_MANY_REQUESTS.into_response())
    }

    /// Takes bucket names off the ingestion channel and increments the
    /// appropriate counter.
    async fn ingester_worker(
        &self,
        mut rx: mpsc::Receiver<String>,
        shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::trace!("Ingester dying in response to shutdown");
                    return;
                }
                key = rx.recv() => {
                    match key {
                        Some(key) => self.ingest(key),
                        None => {
                            tracing::trace!("Ingester dying in response to channel closure");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Count one request against a bucket.
    ///
    /// Existing keys are a plain atomic add. A new key copies the map and
    /// publishes the copy with compare-and-swap, retrying if the map was
    /// switched under us. If the synchroniser swaps the buffer mid-flight
    /// the single increment is lost; not worth more machinery for one
    /// request falling through the cracks.
    fn ingest(&self, key: String) {
        loop {
            let current = self.counters.load_full();
            if let Some(counter) = current.get(&key) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }

            let mut next = CounterMap::with_capacity(current.len() + 1);
            for (k, v) in current.iter() {
                next.insert(k.clone(), Arc::clone(v));
            }
            next.insert(key.clone(), Arc::new(AtomicU64::new(1)));

            let previous = self.counters.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                // uncontended; the key is in the published map
                return;
            }
            // CAS was contended; go again with a reloaded pointer
        }
    }

    /// Periodically sends the counter buffer to the throttling service and
    /// updates the throttled set from the response.
    async fn synchroniser_worker(
        &self,
        client: Arc<dyn CheckinClient>,
        source: Arc<ConfigSource>,
        shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut tick = tokio::time::interval(SYNCHRONISATION_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::trace!("Synchroniser dying in response to shutdown");
                    return;
                }
                _ = tick.tick() => {
                    self.synchronise(client.as_ref(), source.as_ref()).await;
                }
            }
        }
    }

    async fn synchronise(&self, client: &dyn CheckinClient, source: &ConfigSource) {
        // Swap the buffer for a shiny new one
        let previous = self
            .counters
            .swap(Arc::new(CounterMap::with_capacity(DEFAULT_BUFFER_CAPACITY)));

        // DO NOT bail when empty; we still need the buckets to throttle even
        // with no increments to report
        let throttled = match self.report_increments(client, source, &previous).await {
            Ok(buckets) => buckets,
            Err(e) => {
                tracing::error!(error = %e, "Failed to report increments");
                // Don't throttle anything in the failure case
                ThrottledSet::new()
            }
        };

        tracing::debug!(buckets = throttled.len(), "Got buckets to throttle");
        self.throttled.store(Arc::new(throttled));
    }

    /// Sends recently-recorded bucket increments to the throttling service
    /// and returns the buckets that should be throttled.
    async fn report_increments(
        &self,
        client: &dyn CheckinClient,
        source: &ConfigSource,
        buffer: &CounterMap,
    ) -> Result<ThrottledSet, checkin::CheckinError> {
        // If increment reporting is disabled, return immediately
        if !source.bool_at(
            &["hailo", "service", "api", "throttling", "reportIncrements"],
            false,
        ) {
            return Ok(ThrottledSet::new());
        }

        let increments: Vec<BucketIncrement> = buffer
            .iter()
            .map(|(key, counter)| BucketIncrement {
                bucket_key: key.clone(),
                request_count: counter.load(Ordering::Relaxed),
            })
            .collect();

        tracing::debug!(increments = increments.len(), "Reporting increments");
        let start = Instant::now();

        // Requests to the throttling service require ADMIN-level privileges
        // granted to the dedicated "<service>.throttlesync" caller identity.
        let from = format!("{}.throttlesync", self.service_name);
        let result = client.checkin(&from, increments).await;

        match &result {
            Ok(_) => tracing::debug!(elapsed = ?start.elapsed(), "Successfully reported increments"),
            Err(e) => tracing::error!(elapsed = ?start.elapsed(), error = %e, "Check-in failed"),
        }

        result.map(|buckets| buckets.into_iter().collect())
    }
}

/// Middleware decorating the handler chain with throttling. Throttled
/// requests are answered immediately and never reach the mux.
pub async fn throttle_middleware(
    State(engine): State<Arc<ThrottlingEngine>>,
    req: Request,
    next: Next,
) -> Response<Body> {
    let buckets = engine.buckets(&req);
    engine.record(&buckets);

    if engine.any_throttled(&buckets) {
        metrics::record_throttled();
        return engine.throttled_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::checkin::CheckinError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubCheckin {
        throttled: Mutex<Vec<String>>,
        seen: Mutex<Vec<BucketIncrement>>,
        fail: bool,
    }

    #[async_trait]
    impl CheckinClient for StubCheckin {
        async fn checkin(
            &self,
            _from: &str,
            increments: Vec<BucketIncrement>,
        ) -> Result<Vec<String>, CheckinError> {
            self.seen.lock().unwrap().extend(increments);
            if self.fail {
                return Err(CheckinError::Transport("stubbed failure".to_string()));
            }
            Ok(self.throttled.lock().unwrap().clone())
        }
    }

    fn engine_with(
        client: Arc<StubCheckin>,
        report: bool,
    ) -> (Arc<ThrottlingEngine>, Arc<ConfigSource>, Arc<Shutdown>) {
        let source = Arc::new(ConfigSource::new());
        if report {
            source
                .load(
                    br#"{"hailo":{"service":{"api":{"throttling":{"reportIncrements":true}}}}}"#
                        .to_vec(),
                )
                .unwrap();
        }
        let shutdown = Arc::new(Shutdown::new());
        let engine = ThrottlingEngine::new(client, source.clone(), "api-proxy", &shutdown);
        (engine, source, shutdown)
    }

    #[tokio::test]
    async fn test_ingest_counts_existing_and_new_keys() {
        let client = Arc::new(StubCheckin {
            throttled: Mutex::new(vec![]),
            seen: Mutex::new(vec![]),
            fail: false,
        });
        let (engine, _source, _shutdown) = engine_with(client, false);

        engine.ingest("sessId:abc".to_string());
        engine.ingest("sessId:abc".to_string());
        engine.ingest("sessId:def".to_string());

        let counters = engine.counters.load();
        assert_eq!(counters.get("sessId:abc").unwrap().load(Ordering::Relaxed), 2);
        assert_eq!(counters.get("sessId:def").unwrap().load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_synchronise_swaps_buffer_and_reports() {
        let client = Arc::new(StubCheckin {
            throttled: Mutex::new(vec!["sessId:abc".to_string()]),
            seen: Mutex::new(vec![]),
            fail: false,
        });
        let (engine, source, _shutdown) = engine_with(client.clone(), true);

        for _ in 0..10 {
            engine.ingest("sessId:abc".to_string());
        }
        engine.synchronise(client.as_ref(), source.as_ref()).await;

        // the buffer was swapped out and its counts reported
        assert!(engine.counters.load().is_empty());
        let seen = client.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].bucket_key, "sessId:abc");
        assert_eq!(seen[0].request_count, 10);
        drop(seen);

        // and the throttled set took effect
        assert!(engine.any_throttled(&["sessId:abc".to_string()]));
        assert!(!engine.any_throttled(&["sessId:zzz".to_string()]));
    }

    #[tokio::test]
    async fn test_reporting_disabled_produces_empty_set() {
        let client = Arc::new(StubCheckin {
            throttled: Mutex::new(vec!["sessId:abc".to_string()]),
            seen: Mutex::new(vec![]),
            fail: false,
        });
        let (engine, source, _shutdown) = engine_with(client.clone(), false);

        engine.ingest("sessId:abc".to_string());
        engine.synchronise(client.as_ref(), source.as_ref()).await;

        assert!(client.seen.lock().unwrap().is_empty(), "no remote call when disabled");
        assert!(!engine.any_throttled(&["sessId:abc".to_string()]));
    }

    #[tokio::test]
    async fn test_checkin_failure_fails_open() {
        let ok_client = Arc::new(StubCheckin {
            throttled: Mutex::new(vec!["sessId:abc".to_string()]),
            seen: Mutex::new(vec![]),
            fail: false,
        });
        let (engine, source, _shutdown) = engine_with(ok_client.clone(), true);

        engine.synchronise(ok_client.as_ref(), source.as_ref()).await;
        assert!(engine.any_throttled(&["sessId:abc".to_string()]));

        let failing = StubCheckin {
            throttled: Mutex::new(vec![]),
            seen: Mutex::new(vec![]),
            fail: true,
        };
        engine.synchronise(&failing, source.as_ref()).await;
        assert!(
            !engine.any_throttled(&["sessId:abc".to_string()]),
            "a failed check-in must clear the throttled set"
        );
    }

    #[test]
    fn test_throttled_response_body() {
        let client = Arc::new(StubCheckin {
            throttled: Mutex::new(vec![]),
            seen: Mutex::new(vec![]),
            fail: false,
        });
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = rt.enter();
        let (engine, _source, _shutdown) = engine_with(client, false);

        let rsp = engine.throttled_response();
        assert_eq!(rsp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            rsp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
    }
}
