//! HTTP server setup and wiring.
//!
//! # Responsibilities
//! - Construct the control plane, throttler and AZ monitor with their
//!   collaborator clients
//! - Build the axum router with the full middleware chain
//! - Run the listener with graceful shutdown, then collect background tasks
//!
//! Handler chain, outermost first: real-IP rewrite, body buffering,
//! throttling, PCI filter, CORS, mux.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Response, StatusCode};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ConfigSource, ProxyConfig};
use crate::control::extractor::Features;
use crate::control::ControlPlane;
use crate::health::coordinator::{Coordinator, HttpCoordinator};
use crate::health::probe::{AzStatusClient, ConnectivityProbe, HttpAzStatusClient, TcpProbe};
use crate::health::StatusMonitor;
use crate::http::cors::cors_middleware;
use crate::http::endpoints::endpoints_handler;
use crate::http::h1::H1Proxy;
use crate::http::h2::{HttpRpcClient, RpcClient};
use crate::http::handler::{dispatch_handler, favicon_handler, version_handler};
use crate::http::pcifilter::{pci_filter_middleware, PciFilter};
use crate::http::realip::real_ip_middleware;
use crate::http::rpc::{rpc_handler, AdminVerifier, DenyAllVerifier};
use crate::http::{buffer, handler};
use crate::lifecycle::Shutdown;
use crate::stats::Stats;
use crate::throttle::checkin::{CheckinClient, HttpCheckinClient};
use crate::throttle::{throttle_middleware, ThrottlingEngine};

/// Hosts dialled by `/status` to determine external connectivity.
const STATUS_PROBE_HOSTS: [&str; 3] = ["google.com:80", "yahoo.com:80", "bing.com:80"];
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Collaborator clients, swappable for tests.
pub struct Dependencies {
    pub checkin: Arc<dyn CheckinClient>,
    pub rpc: Arc<dyn RpcClient>,
    pub coordinator: Arc<dyn Coordinator>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub monitoring: Arc<dyn AzStatusClient>,
    pub admin: Arc<dyn AdminVerifier>,
}

impl Dependencies {
    /// Production clients, built from the bootstrap configuration.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build upstream HTTP client");

        Self {
            checkin: Arc::new(HttpCheckinClient::new(
                client.clone(),
                &config.upstreams.throttling_url,
            )),
            rpc: Arc::new(HttpRpcClient::new(client.clone(), &config.upstreams.h2_rpc_url)),
            coordinator: Arc::new(HttpCoordinator::new(
                client.clone(),
                &config.upstreams.coordinator_url,
            )),
            probe: Arc::new(TcpProbe::new(&config.upstreams.broker_addr)),
            monitoring: Arc::new(HttpAzStatusClient::new(
                client,
                &config.upstreams.monitoring_url,
                &config.service.name,
            )),
            admin: Arc::new(DenyAllVerifier),
        }
    }
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub source: Arc<ConfigSource>,
    pub control: Arc<ControlPlane>,
    pub throttler: Arc<ThrottlingEngine>,
    pub monitor: Arc<StatusMonitor>,
    pub stats: Arc<Stats>,
    pub h1: Arc<H1Proxy>,
    pub rpc: Arc<dyn RpcClient>,
    pub admin: Arc<dyn AdminVerifier>,
}

impl AppState {
    pub fn sanitise_errors(&self) -> bool {
        self.source.bool_at(&["hailo", "api", "sanitiseErrors"], false)
    }
}

/// Extract the session ID the same way auth would, from a buffered request.
pub fn session_id_for(req: &Request<Body>) -> String {
    handler::extractor_for(req).value("session_id")
}

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    shutdown: Arc<Shutdown>,
}

impl HttpServer {
    /// Create a new server with production collaborator clients.
    pub fn new(config: ProxyConfig, source: Arc<ConfigSource>, shutdown: Arc<Shutdown>) -> Self {
        let deps = Dependencies::from_config(&config);
        Self::with_dependencies(config, source, shutdown, deps)
    }

    /// Create a new server with explicit collaborator clients.
    pub fn with_dependencies(
        config: ProxyConfig,
        source: Arc<ConfigSource>,
        shutdown: Arc<Shutdown>,
        deps: Dependencies,
    ) -> Self {
        let config = Arc::new(config);

        let control = ControlPlane::new(
            source.clone(),
            config.paths.last_good_config.clone(),
            shutdown.clone(),
        );
        let throttler = ThrottlingEngine::new(
            deps.checkin,
            source.clone(),
            &config.service.name,
            &shutdown,
        );
        let monitor = StatusMonitor::new(
            &config.health.az_name,
            deps.coordinator,
            deps.probe,
            deps.monitoring,
            &shutdown,
        );
        let pci_filter = PciFilter::new(source.clone(), &shutdown);
        let h1 = Arc::new(H1Proxy::new(
            source.clone(),
            Duration::from_secs(config.timeouts.h1_connect_secs),
            Duration::from_secs(config.timeouts.h1_response_secs),
        ));

        let state = AppState {
            config: config.clone(),
            source,
            control,
            throttler: throttler.clone(),
            monitor,
            stats: Arc::new(Stats::new()),
            h1,
            rpc: deps.rpc,
            admin: deps.admin,
        };

        let router = Self::build_router(&config, state, throttler, pci_filter);
        Self { router, shutdown }
    }

    /// Build the axum router with all middleware layers.
    fn build_router(
        config: &ProxyConfig,
        state: AppState,
        throttler: Arc<ThrottlingEngine>,
        pci_filter: Arc<PciFilter>,
    ) -> Router {
        Router::new()
            .route("/version", get(version_handler))
            .route("/favicon.ico", get(favicon_handler))
            .route("/status", get(status_handler))
            .route("/v2/az/status", get(az_status_handler))
            .route("/endpoints", get(endpoints_handler))
            .route("/rpc", any(rpc_handler)) // RPC direct to H2 service
            .route("/v2/h2/call", any(rpc_handler)) // (Deprecated)
            .fallback(dispatch_handler) // Default handler
            .with_state(state)
            // innermost layer first: last layer added wraps all of the above
            .layer(middleware::from_fn(cors_middleware))
            .layer(middleware::from_fn_with_state(pci_filter, pci_filter_middleware))
            .layer(middleware::from_fn_with_state(throttler, throttle_middleware))
            .layer(middleware::from_fn(buffer::buffer_body_middleware))
            .layer(middleware::from_fn(real_ip_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.read_secs)))
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Returns once the shutdown signal fires and every background task has
    /// been collected. In-flight requests finish via their own timeouts.
    pub async fn run(self, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let mut shutdown_rx = self.shutdown.subscribe();
        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        self.shutdown.join_all().await;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// `/status`: synchronously establishes external connections to determine
/// the health of the network. Only if every attempt fails is a 500 returned.
pub async fn status_handler() -> Response<Body> {
    let mut ok = STATUS_PROBE_HOSTS.len();
    let mut info = String::new();

    for host in STATUS_PROBE_HOSTS {
        match tokio::time::timeout(STATUS_PROBE_TIMEOUT, tokio::net::TcpStream::connect(host)).await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                ok -= 1;
                info = e.to_string();
            }
            Err(_) => {
                ok -= 1;
                info = format!("dial {host}: timed out");
            }
        }
    }

    if ok == 0 {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error establishing external connections: {info}"),
        )
            .into_response();
    }

    (StatusCode::OK, "OK").into_response()
}

/// `/v2/az/status`: the AZ health as reported by the status monitor.
pub async fn az_status_handler(State(state): State<AppState>) -> Response<Body> {
    let healthy = state.monitor.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        format!(r#"{{"IsHealthy":{healthy}}}"#),
    )
        .into_response()
}
