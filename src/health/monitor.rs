//! The AZ status monitor.
//!
//! # Responsibilities
//! - Check broker connectivity and the monitoring service's AZ verdict on a
//!   fixed cadence
//! - Fail over this AZ behind a cluster-wide single-holder lock
//! - Recover and release the lock when both signals are healthy again
//!
//! # Design Decisions
//! - The failover lock is a single ephemeral node: one failed AZ at a time,
//!   auto-released if the holding instance dies
//! - If another instance in OUR AZ holds the lock we adopt the failed state
//!   without holding it ourselves
//! - If a DIFFERENT AZ holds the lock we abort our failover; this is the
//!   safety valve against cascading AZ failover

use std::sync::Arc;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use crate::health::coordinator::Coordinator;
use crate::health::probe::{AzStatusClient, ConnectivityProbe};
use crate::lifecycle::Shutdown;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Ephemeral node marking which AZ (if any) has failed over.
pub const FAILOVER_LOCK_PATH: &str = "/hailo-2-api-az-failover";

/// The kind of failure that took this AZ out of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Failure {
    #[default]
    None,
    Connectivity,
    Monitoring,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Failure::None => "No failures detected",
            Failure::Connectivity => "Connectivity Failure",
            Failure::Monitoring => "Monitoring Failure",
        };
        f.write_str(s)
    }
}

/// The AZ health state for this instance.
#[derive(Debug, Clone)]
pub struct AzState {
    pub is_healthy: bool,
    pub failure_type: Failure,
    pub az_name: String,
    pub last_changed: SystemTime,
    pub lock_handle: Option<String>,
}

/// Monitors this instance's AZ health and arbitrates cluster-wide failover.
pub struct StatusMonitor {
    state: RwLock<AzState>,
    coordinator: Arc<dyn Coordinator>,
    probe: Arc<dyn ConnectivityProbe>,
    monitoring: Arc<dyn AzStatusClient>,
}

impl StatusMonitor {
    /// Create the monitor and kick off the monitoring loop.
    ///
    /// Active monitoring only starts when the local AZ name is known; an
    /// instance that cannot identify its AZ stays healthy and passive.
    pub fn new(
        az_name: &str,
        coordinator: Arc<dyn Coordinator>,
        probe: Arc<dyn ConnectivityProbe>,
        monitoring: Arc<dyn AzStatusClient>,
        shutdown: &Shutdown,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            state: RwLock::new(AzState {
                is_healthy: true,
                failure_type: Failure::None,
                az_name: az_name.to_string(),
                last_changed: SystemTime::now(),
                lock_handle: None,
            }),
            coordinator,
            probe,
            monitoring,
        });

        if az_name == "undefined" {
            tracing::error!("Unable to determine the local AZ; active monitoring disabled");
            return monitor;
        }

        let looped = monitor.clone();
        let mut shutdown_rx = shutdown.subscribe();
        shutdown.spawn("az-status-monitor", async move {
            tracing::debug!("Starting the AZ monitor");
            loop {
                looped.tick().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        });

        monitor
    }

    pub fn is_healthy(&self) -> bool {
        self.state.read().expect("az state poisoned").is_healthy
    }

    pub fn state(&self) -> AzState {
        self.state.read().expect("az state poisoned").clone()
    }

    /// One monitoring pass: connectivity first, then (only while connected)
    /// the monitoring service. A monitoring call failure leaves the current
    /// state untouched, so an AZ that failed over stays failed until the
    /// service can be reached again.
    async fn tick(&self) {
        let connected = self.probe.is_connected().await;
        self.interpret_connectivity(connected).await;

        if connected {
            let az_name = self.state().az_name;
            match self.monitoring.az_status(&az_name).await {
                Ok(az_healthy) => self.interpret_az_status(az_healthy).await,
                Err(e) => {
                    tracing::error!(error = %e, "Unable to call the monitoring service");
                }
            }
        }
    }

    /// Failover logic in respect of broker connectivity.
    async fn interpret_connectivity(&self, connected: bool) {
        if !connected {
            tracing::info!("Local instance is unable to connect to the broker");
            self.failover(Failure::Connectivity).await;
            return;
        }

        // Recover only if we had a connectivity issue previously
        let state = self.state();
        if !state.is_healthy && state.failure_type == Failure::Connectivity {
            tracing::info!("Local instance successfully reconnected to the broker");
            self.recover().await;
        }
    }

    /// Failover logic in respect of issues reported by the monitoring
    /// service.
    async fn interpret_az_status(&self, az_healthy: bool) {
        let state = self.state();

        if !az_healthy && state.is_healthy {
            tracing::info!(az = %state.az_name, "Local AZ reported unhealthy by the monitoring service");
            self.failover(Failure::Monitoring).await;
        }

        if az_healthy && !state.is_healthy {
            tracing::info!(
                az = %state.az_name,
                "Local AZ reported healthy by the monitoring service - returning to the pool"
            );
            self.recover().await;
        }
    }

    /// Fail over our AZ, recording the failure type. Requires either taking
    /// the cluster-wide lock or finding it already held by our own AZ.
    async fn failover(&self, failure: Failure) {
        let az_name = self.state().az_name;

        let lock_handle = match self
            .coordinator
            .create_ephemeral(FAILOVER_LOCK_PATH, &az_name)
            .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::debug!(error = %e, "Unable to get the failover lock");
                match self.coordinator.get(FAILOVER_LOCK_PATH).await {
                    Ok(failed_az) if failed_az == az_name => {
                        // Another instance in our AZ already failed over;
                        // agree with it without holding the lock
                        None
                    }
                    Ok(failed_az) => {
                        tracing::info!(
                            our_az = %az_name,
                            failed_az = %failed_az,
                            "Aborting AZ failover - another AZ is already marked as unhealthy"
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Unable to read the failover lock");
                        return;
                    }
                }
            }
        };

        tracing::info!(az = %az_name, "Failing over AZ and exiting the load balancer pool");
        let mut state = self.state.write().expect("az state poisoned");
        if let Some(handle) = lock_handle {
            state.lock_handle = Some(handle);
        }
        state.is_healthy = false;
        state.failure_type = failure;
        state.last_changed = SystemTime::now();
    }

    /// Recover a failed AZ, releasing the lock if we hold it.
    async fn recover(&self) {
        let handle = {
            let mut state = self.state.write().expect("az state poisoned");
            state.lock_handle.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = self.coordinator.delete(&handle).await {
                tracing::error!(error = %e, "Failed to remove the failover lock");
            }
        }

        let mut state = self.state.write().expect("az state poisoned");
        state.is_healthy = true;
        state.failure_type = Failure::None;
        state.last_changed = SystemTime::now();
    }
}
