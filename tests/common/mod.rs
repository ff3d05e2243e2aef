//! Shared fixtures and stubs for integration testing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use api_proxy::config::{ConfigSource, ProxyConfig};
use api_proxy::health::coordinator::InMemoryCoordinator;
use api_proxy::health::probe::{AzStatusClient, AzStatusError, ConnectivityProbe};
use api_proxy::http::h2::{RequestEnvelope, RpcClient, RpcResponse};
use api_proxy::http::rpc::DenyAllVerifier;
use api_proxy::http::server::Dependencies;
use api_proxy::http::HttpServer;
use api_proxy::lifecycle::Shutdown;
use api_proxy::throttle::checkin::{BucketIncrement, CheckinClient, CheckinError};

/// Dynamic configuration used by most tests: two regions, driver/customer
/// routing rules, a throttle path and a deprecate path.
pub const FIXTURE_CONFIG: &str = r#"{"controlPlane":{
    "configVersion":10001,
    "hobModes":{"LON":"h1","default":"h2"},
    "hobRegions":{"ATL":"us-east-1","BOS":"us-east-1","LON":"eu-west-1","NYC":"us-east-1"},
    "regions":{
        "eu-west-1":{"id":"eu-west-1","status":"ONLINE","failover":["us-east-1"],
            "apps":{"customer":{"api":"api-customer-eu-west-1-live.elasticride.com"},
                    "default":{"api":"api-driver-london.elasticride.com"},
                    "driver":{"api":"api-driver-eu-west-1-live.elasticride.com"}}},
        "us-east-1":{"id":"us-east-1","status":"ONLINE","failover":["eu-west-1"],
            "apps":{"default":{"api":"api2-us-east-1-live.elasticride.com"}}}},
    "rules":{
        "r1":{"action":1,"match":{"path":"/v1/driver/index","proportion":1,"regulatoryArea":"LON,DUB,NYC","source":"driver"}},
        "r2":{"action":2,"match":{"path":"/v1/customer/neardrivers","proportion":1,"source":"customer"}},
        "r3":{"action":3,"match":{"path":"/throttle","proportion":1}},
        "r4":{"action":4,"match":{"path":"/deprecated","proportion":1}}
    }},
    "hailo":{"service":{"api":{"throttling":{"reportIncrements":true}}}}
}"#;

/// Like [`FIXTURE_CONFIG`], but with us-east-1 offline so NYC traffic fails
/// over to eu-west-1.
pub const FIXTURE_CONFIG_US_OFFLINE: &str = r#"{"controlPlane":{
    "configVersion":10001,
    "hobModes":{"default":"h2"},
    "hobRegions":{"LON":"eu-west-1","NYC":"us-east-1"},
    "regions":{
        "eu-west-1":{"id":"eu-west-1","status":"ONLINE",
            "apps":{"default":{"api":"api-driver-london.elasticride.com"}}},
        "us-east-1":{"id":"us-east-1","status":"OFFLINE","failover":["eu-west-1"],
            "apps":{"default":{"api":"api2-us-east-1-live.elasticride.com"}}}},
    "rules":{
        "r3":{"action":3,"match":{"path":"/throttle","proportion":1}}
    }},
    "hailo":{"service":{"api":{"throttling":{"reportIncrements":true}}}}
}"#;

/// Check-in stub: records reported increments and returns a controllable
/// throttled-bucket list.
pub struct StubCheckin {
    pub throttled: Mutex<Vec<String>>,
    pub seen: Mutex<Vec<BucketIncrement>>,
}

impl StubCheckin {
    pub fn new() -> Self {
        Self {
            throttled: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn set_throttled(&self, buckets: &[&str]) {
        *self.throttled.lock().unwrap() = buckets.iter().map(|b| b.to_string()).collect();
    }

    pub fn seen_count(&self, bucket: &str) -> u64 {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.bucket_key == bucket)
            .map(|i| i.request_count)
            .sum()
    }
}

#[async_trait]
impl CheckinClient for StubCheckin {
    async fn checkin(
        &self,
        _from: &str,
        increments: Vec<BucketIncrement>,
    ) -> Result<Vec<String>, CheckinError> {
        self.seen.lock().unwrap().extend(increments);
        Ok(self.throttled.lock().unwrap().clone())
    }
}

/// RPC stub standing in for the H2 platform: returns a canned 200, and
/// records the envelopes it saw.
pub struct StubRpc {
    pub envelopes: Mutex<Vec<RequestEnvelope>>,
    pub response_headers: Mutex<Vec<String>>,
}

impl StubRpc {
    pub fn new() -> Self {
        Self {
            envelopes: Mutex::new(Vec::new()),
            response_headers: Mutex::new(Vec::new()),
        }
    }

    pub fn last_envelope(&self) -> Option<RequestEnvelope> {
        self.envelopes.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl RpcClient for StubRpc {
    async fn call(&self, envelope: RequestEnvelope) -> Result<RpcResponse, api_proxy::errors::ApiError> {
        self.envelopes.lock().unwrap().push(envelope);
        Ok(RpcResponse {
            status_code: 200,
            body: r#"{"status":true,"payload":"OK"}"#.to_string(),
            header: self.response_headers.lock().unwrap().clone(),
        })
    }
}

pub struct AlwaysConnected;

#[async_trait]
impl ConnectivityProbe for AlwaysConnected {
    async fn is_connected(&self) -> bool {
        true
    }
}

pub struct AlwaysHealthy;

#[async_trait]
impl AzStatusClient for AlwaysHealthy {
    async fn az_status(&self, _az: &str) -> Result<bool, AzStatusError> {
        Ok(true)
    }
}

/// A running proxy instance plus handles to its stubs.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub checkin: Arc<StubCheckin>,
    pub rpc: Arc<StubRpc>,
    pub shutdown: Arc<Shutdown>,
}

impl TestProxy {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

static INSTANCE: AtomicU16 = AtomicU16::new(0);

/// Boot a proxy on an ephemeral port with stubbed collaborators.
pub async fn spawn_proxy(dynamic_config: &str) -> TestProxy {
    let instance = INSTANCE.fetch_add(1, Ordering::SeqCst);
    let mut config = ProxyConfig::default();
    config.paths.last_good_config = std::env::temp_dir()
        .join(format!("api-proxy-test-{}-{instance}", std::process::id()))
        .join("last-good")
        .to_string_lossy()
        .into_owned();

    let source = Arc::new(ConfigSource::new());
    source
        .load(dynamic_config.as_bytes().to_vec())
        .expect("fixture config must parse");

    let checkin = Arc::new(StubCheckin::new());
    let rpc = Arc::new(StubRpc::new());
    let shutdown = Arc::new(Shutdown::new());

    let deps = Dependencies {
        checkin: checkin.clone(),
        rpc: rpc.clone(),
        coordinator: Arc::new(InMemoryCoordinator::new()),
        probe: Arc::new(AlwaysConnected),
        monitoring: Arc::new(AlwaysHealthy),
        admin: Arc::new(DenyAllVerifier),
    };

    let server = HttpServer::with_dependencies(config, source, shutdown.clone(), deps);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });

    // Wait for the server to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestProxy {
        addr,
        checkin,
        rpc,
        shutdown,
    }
}
