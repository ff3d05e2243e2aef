//! Bootstrap configuration schema definitions.
//!
//! This is the static configuration read once at startup. Everything that
//! changes at runtime (rules, regions, feature flags) lives in the dynamic
//! configuration document instead; see [`crate::config::source`].

use serde::{Deserialize, Serialize};

/// Root bootstrap configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Service identity used in RPC scoping and dotted error codes.
    pub service: ServiceConfig,

    /// Filesystem paths.
    pub paths: PathsConfig,

    /// Collaborator endpoints.
    pub upstreams: UpstreamConfig,

    /// AZ self-health settings.
    pub health: HealthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Inbound request read timeout in seconds.
    pub read_secs: u64,

    /// Response write timeout in seconds.
    pub write_secs: u64,

    /// H1 upstream dial timeout in seconds.
    pub h1_connect_secs: u64,

    /// H1 upstream response header timeout in seconds.
    pub h1_response_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 30,
            write_secs: 30,
            h1_connect_secs: 5,
            h1_response_secs: 30,
        }
    }
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, used for dotted error codes and the throttle-sync
    /// caller identity.
    pub name: String,

    /// Prefix prepended when inferring an RPC service name from a path.
    pub rpc_prefix: String,

    /// Namespace prefix that requires ADMIN privileges on the RPC bridge.
    pub privileged_prefix: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "api-proxy".to_string(),
            rpc_prefix: "com.hailo.api.".to_string(),
            privileged_prefix: "com.hailo.kernel.".to_string(),
        }
    }
}

/// Filesystem paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where the last good dynamic configuration is persisted.
    pub last_good_config: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            last_good_config: "/opt/hailo/var/cache/api-proxy-config".to_string(),
        }
    }
}

/// Collaborator endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// H2 RPC gateway URL.
    pub h2_rpc_url: String,

    /// Throttling service check-in URL.
    pub throttling_url: String,

    /// Monitoring service AZ-status URL.
    pub monitoring_url: String,

    /// Coordinator base URL for the AZ failover lock.
    pub coordinator_url: String,

    /// Broker address probed for local connectivity (host:port).
    pub broker_addr: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            h2_rpc_url: "http://localhost:8480/rpc".to_string(),
            throttling_url: "http://localhost:8481/checkin".to_string(),
            monitoring_url: "http://localhost:8482/azstatus".to_string(),
            coordinator_url: "http://localhost:8483".to_string(),
            broker_addr: "localhost:5672".to_string(),
        }
    }
}

/// AZ self-health settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Name of the availability zone this instance runs in. The literal
    /// "undefined" disables active monitoring, matching the behaviour when
    /// the platform cannot determine its own AZ.
    pub az_name: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            az_name: "undefined".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
