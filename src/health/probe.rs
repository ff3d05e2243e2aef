//! Health signal inputs: local broker connectivity and the monitoring
//! service's verdict for this AZ.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Local broker connectivity check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Probes connectivity by dialling the broker's TCP endpoint.
pub struct TcpProbe {
    addr: String,
}

impl TcpProbe {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn is_connected(&self) -> bool {
        matches!(
            tokio::time::timeout(DIAL_TIMEOUT, tokio::net::TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AzStatusError {
    #[error("monitoring service call failed: {0}")]
    Transport(String),
    #[error("monitoring service returned status {0}")]
    Status(u16),
}

/// The monitoring service's AZ-status endpoint.
#[async_trait]
pub trait AzStatusClient: Send + Sync {
    /// Whether the monitoring service considers the named AZ healthy.
    /// One shot; the caller decides the retry policy (currently: none).
    async fn az_status(&self, az: &str) -> Result<bool, AzStatusError>;
}

#[derive(Serialize)]
struct AzStatusRequest<'a> {
    #[serde(rename = "azName")]
    az_name: &'a str,
}

#[derive(Deserialize)]
struct AzStatusResponse {
    #[serde(rename = "isHealthy")]
    is_healthy: bool,
}

/// HTTP implementation of the monitoring-service RPC.
pub struct HttpAzStatusClient {
    client: reqwest::Client,
    url: String,
    from: String,
}

impl HttpAzStatusClient {
    pub fn new(client: reqwest::Client, url: &str, from: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl AzStatusClient for HttpAzStatusClient {
    async fn az_status(&self, az: &str) -> Result<bool, AzStatusError> {
        let response = self
            .client
            .post(&self.url)
            .header("X-From", &self.from)
            .json(&AzStatusRequest { az_name: az })
            .send()
            .await
            .map_err(|e| AzStatusError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AzStatusError::Status(response.status().as_u16()));
        }

        let parsed: AzStatusResponse = response
            .json()
            .await
            .map_err(|e| AzStatusError::Transport(e.to_string()))?;
        Ok(parsed.is_healthy)
    }
}
