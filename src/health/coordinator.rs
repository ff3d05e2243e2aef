//! Coordinator client for the AZ failover lock.
//!
//! The lock is an ephemeral node: it auto-releases when the owning instance
//! dies, preventing permanent lockout.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("node already exists")]
    AlreadyExists,
    #[error("node not found")]
    NotFound,
    #[error("coordinator call failed: {0}")]
    Transport(String),
    #[error("coordinator returned status {0}")]
    Status(u16),
}

/// Ephemeral-node operations against the shared coordinator.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create an ephemeral node holding `data`, returning an opaque handle
    /// used to delete it. Fails with `AlreadyExists` when the node is held.
    async fn create_ephemeral(&self, path: &str, data: &str) -> Result<String, CoordinatorError>;

    /// Read an existing node's payload.
    async fn get(&self, path: &str) -> Result<String, CoordinatorError>;

    /// Delete a node previously created by this client.
    async fn delete(&self, handle: &str) -> Result<(), CoordinatorError>;
}

/// HTTP implementation against a coordinator gateway.
pub struct HttpCoordinator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCoordinator {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn node_url(&self, path: &str) -> String {
        format!("{}/nodes{}", self.base_url, path)
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn create_ephemeral(&self, path: &str, data: &str) -> Result<String, CoordinatorError> {
        let response = self
            .client
            .put(self.node_url(path))
            .query(&[("ephemeral", "true")])
            .body(data.to_string())
            .send()
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;

        match response.status().as_u16() {
            200 | 201 => Ok(path.to_string()),
            409 => Err(CoordinatorError::AlreadyExists),
            status => Err(CoordinatorError::Status(status)),
        }
    }

    async fn get(&self, path: &str) -> Result<String, CoordinatorError> {
        let response = self
            .client
            .get(self.node_url(path))
            .send()
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;

        match response.status().as_u16() {
            200 => response
                .text()
                .await
                .map_err(|e| CoordinatorError::Transport(e.to_string())),
            404 => Err(CoordinatorError::NotFound),
            status => Err(CoordinatorError::Status(status)),
        }
    }

    async fn delete(&self, handle: &str) -> Result<(), CoordinatorError> {
        let response = self
            .client
            .delete(self.node_url(handle))
            .send()
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;

        match response.status().as_u16() {
            200 | 204 => Ok(()),
            404 => Err(CoordinatorError::NotFound),
            status => Err(CoordinatorError::Status(status)),
        }
    }
}

/// In-process coordinator, for tests and single-node development.
#[derive(Default)]
pub struct InMemoryCoordinator {
    nodes: Mutex<HashMap<String, String>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn create_ephemeral(&self, path: &str, data: &str) -> Result<String, CoordinatorError> {
        let mut nodes = self.nodes.lock().expect("coordinator map poisoned");
        if nodes.contains_key(path) {
            return Err(CoordinatorError::AlreadyExists);
        }
        nodes.insert(path.to_string(), data.to_string());
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> Result<String, CoordinatorError> {
        self.nodes
            .lock()
            .expect("coordinator map poisoned")
            .get(path)
            .cloned()
            .ok_or(CoordinatorError::NotFound)
    }

    async fn delete(&self, handle: &str) -> Result<(), CoordinatorError> {
        self.nodes
            .lock()
            .expect("coordinator map poisoned")
            .remove(handle)
            .map(|_| ())
            .ok_or(CoordinatorError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_single_holder() {
        let coord = InMemoryCoordinator::new();
        let handle = coord.create_ephemeral("/lock", "az-a").await.unwrap();
        assert!(matches!(
            coord.create_ephemeral("/lock", "az-b").await,
            Err(CoordinatorError::AlreadyExists)
        ));
        assert_eq!(coord.get("/lock").await.unwrap(), "az-a");

        coord.delete(&handle).await.unwrap();
        assert!(matches!(coord.get("/lock").await, Err(CoordinatorError::NotFound)));
    }
}
