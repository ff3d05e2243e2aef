//! Check-in client for the remote throttling service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One bucket's request count since the last check-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketIncrement {
    #[serde(rename = "bucketKey")]
    pub bucket_key: String,
    #[serde(rename = "requestCount")]
    pub request_count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckinError {
    #[error("throttling service call failed: {0}")]
    Transport(String),
    #[error("throttling service returned status {0}")]
    Status(u16),
}

/// The throttling service's check-in endpoint.
///
/// Takes the per-bucket increments recorded since the last call and returns
/// the bucket keys that should currently be throttled.
#[async_trait]
pub trait CheckinClient: Send + Sync {
    async fn checkin(
        &self,
        from: &str,
        increments: Vec<BucketIncrement>,
    ) -> Result<Vec<String>, CheckinError>;
}

#[derive(Serialize)]
struct CheckinRequest<'a> {
    from: &'a str,
    #[serde(rename = "bucketRequests")]
    bucket_requests: Vec<BucketIncrement>,
}

#[derive(Deserialize)]
struct CheckinResponse {
    #[serde(rename = "throttledBuckets", default)]
    throttled_buckets: Vec<String>,
}

/// HTTP implementation of the check-in RPC.
pub struct HttpCheckinClient {
    client: reqwest::Client,
    url: String,
}

impl HttpCheckinClient {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl CheckinClient for HttpCheckinClient {
    async fn checkin(
        &self,
        from: &str,
        increments: Vec<BucketIncrement>,
    ) -> Result<Vec<String>, CheckinError> {
        let request = CheckinRequest {
            from,
            bucket_requests: increments,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CheckinError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CheckinError::Status(response.status().as_u16()));
        }

        let parsed: CheckinResponse = response
            .json()
            .await
            .map_err(|e| CheckinError::Transport(e.to_string()))?;

        Ok(parsed.throttled_buckets)
    }
}
