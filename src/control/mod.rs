//! The control plane: config-driven routing of traffic to regions (region
//! "pinning") and to the H1 vs H2 backends.
//!
//! # Responsibilities
//! - Keep the config snapshot fresh from the dynamic configuration source
//! - Validate, hash and atomically publish each new generation
//! - Persist the most recent validated raw config as the "last good" copy
//! - Hand out per-request routers over the current snapshot
//!
//! # Design Decisions
//! - Readers take the snapshot through one atomic load; no locks on the
//!   request path
//! - At most one load cycle runs at a time; failed loads retry until
//!   shutdown
//! - A failed persist never rolls back an in-memory publish

pub mod extractor;
pub mod hostmap;
pub mod regions;
pub mod router;
pub mod rules;
pub mod snapshot;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::config::ConfigSource;
use crate::control::extractor::Extractor;
use crate::control::regions::Region;
use crate::control::router::RuleRouter;
use crate::control::rules::Rule;
use crate::control::snapshot::ConfigSnapshot;
use crate::lifecycle::Shutdown;

const RELOAD_FAIL_DELAY: Duration = Duration::from_secs(1);

/// Error type for a dynamic config load attempt.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("error loading config -- zero length")]
    Empty,
    #[error("JSON unmarshal error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Default, Deserialize)]
struct ParsedConfig {
    #[serde(rename = "controlPlane", default)]
    control_plane: ParsedControlPlane,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ParsedControlPlane {
    rules: BTreeMap<String, Rule>,
    regions: BTreeMap<String, Region>,
    #[serde(rename = "hobRegions")]
    hob_regions: BTreeMap<String, String>,
    #[serde(rename = "configVersion")]
    config_version: f64,
    #[serde(rename = "hobModes")]
    hob_modes: BTreeMap<String, String>,
}

/// Config-based control of traffic routing.
pub struct ControlPlane {
    snapshot: ArcSwap<ConfigSnapshot>,
    source: Arc<ConfigSource>,
    shutdown: Arc<Shutdown>,
    last_good_path: PathBuf,
    /// Used to only allow one config reload cycle at a time.
    load_cycle_lock: tokio::sync::Mutex<()>,
}

/// Load the last known "good" config from file into the config source, so
/// first requests have something to match on. Tried once; failure is logged
/// and non-fatal.
pub fn load_last_good_config(source: &ConfigSource, path: &Path) {
    match std::fs::read(path) {
        Ok(raw) => {
            if let Err(e) = source.load(raw) {
                tracing::error!(error = %e, "Last known config load failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "Last known config load failed");
        }
    }
}

impl ControlPlane {
    /// Initialise a control plane that loads via the config source.
    ///
    /// Performs one synchronous load attempt so the first requests see
    /// config, then reloads in the background on every change notification.
    pub fn new(
        source: Arc<ConfigSource>,
        last_good_path: impl Into<PathBuf>,
        shutdown: Arc<Shutdown>,
    ) -> Arc<Self> {
        let cp = Arc::new(Self {
            snapshot: ArcSwap::from_pointee(ConfigSnapshot::default()),
            source: source.clone(),
            shutdown: shutdown.clone(),
            last_good_path: last_good_path.into(),
            load_cycle_lock: tokio::sync::Mutex::new(()),
        });

        if let Err(e) = cp.try_load() {
            tracing::error!(error = %e, "Failed to load config on first attempt (synchronously)");
        }

        let reload_cp = cp.clone();
        let mut changes = source.subscribe();
        let mut shutdown_rx = shutdown.subscribe();
        shutdown.spawn("control-plane-reload", async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Control plane reload loop exiting on shutdown");
                        return;
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Config source dropped; reload loop exiting");
                            return;
                        }
                        tracing::debug!("Got notification of config change; reloading rules");
                        reload_cp.load_cycle().await;
                    }
                }
            }
        });

        cp
    }

    /// The current snapshot. One atomic load; the returned value stays
    /// coherent regardless of concurrent publishes.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    pub fn regions(&self) -> BTreeMap<String, Region> {
        self.snapshot.load().regions.clone()
    }

    pub fn hob_regions(&self) -> BTreeMap<String, String> {
        self.snapshot.load().hob_regions.clone()
    }

    pub fn hob_modes(&self) -> BTreeMap<String, String> {
        self.snapshot.load().hob_modes.clone()
    }

    /// Prepare to route a request to a backend and/or region.
    pub fn router(self: &Arc<Self>, extractor: Extractor) -> RuleRouter {
        RuleRouter::new(self.clone(), extractor)
    }

    /// Blocks on loading until successfully completed, retrying with a fixed
    /// delay. Once completed the "last good" config has been written out.
    /// There can only be one load cycle at a time.
    async fn load_cycle(&self) {
        let _guard = self.load_cycle_lock.lock().await;

        loop {
            if self.shutdown.triggered() {
                return;
            }
            match self.try_load() {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load config");
                    tokio::time::sleep(RELOAD_FAIL_DELAY).await;
                }
            }
        }
    }

    /// Parse config from the source and check validity, with fairly strict
    /// rules and expectations.
    fn try_load(&self) -> Result<(), LoadError> {
        tracing::trace!("Trying to load config");
        // for our last-known "good copy" -- grab ALL config at once
        let raw = self.source.raw();

        if raw.is_empty() {
            return Err(LoadError::Empty);
        }

        let parsed: ParsedConfig = serde_json::from_slice(&raw)?;

        let sorted = rules::sort_rules(parsed.control_plane.rules);
        let regions = parsed.control_plane.regions;
        let hob_regions = parsed.control_plane.hob_regions;
        let hob_modes = parsed.control_plane.hob_modes;
        let config_version = parsed.control_plane.config_version as i64;

        // sanity check
        if sorted.is_empty() {
            return Err(LoadError::Validation(
                "Must have at least one routing rule defined".to_string(),
            ));
        }
        if regions.is_empty() {
            return Err(LoadError::Validation(
                "Must have at least one region defined".to_string(),
            ));
        }

        // see if anything has changed
        let new_hash = ConfigSnapshot::content_hash(
            &sorted,
            &regions,
            &hob_regions,
            config_version,
            &hob_modes,
        );
        if new_hash == self.snapshot.load().config_hash {
            return Ok(());
        }

        let loaded = ConfigSnapshot {
            rules: sorted,
            regions,
            hob_regions,
            hob_modes,
            config_version,
            config_hash: new_hash,
        };

        tracing::info!(
            rules = loaded.rules.len(),
            regions = loaded.regions.len(),
            hob_regions = loaded.hob_regions.len(),
            hob_modes = loaded.hob_modes.len(),
            region_ts = loaded.config_version,
            "Control plane config loaded"
        );

        self.snapshot.store(Arc::new(loaded));

        if let Err(e) = self.save_config_to_file(&raw) {
            tracing::error!(error = %e, "Failed to write last good config");
        }

        Ok(())
    }

    /// Save the raw config to the last-good file. Called after every
    /// successful load/validate cycle, so the content is known valid.
    /// Writes to a temp file in the same directory and renames, to minimise
    /// the likelihood of corrupting the existing copy.
    fn save_config_to_file(&self, raw: &[u8]) -> std::io::Result<()> {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

        let dir = self
            .last_good_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        if !dir.exists() {
            std::fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)?;
        }

        let tmp_path = self.last_good_path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp_path, raw)?;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644))?;
        std::fs::rename(&tmp_path, &self.last_good_path)?;

        tracing::info!(path = %self.last_good_path.display(), "Last good config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_json() -> Vec<u8> {
        br#"{"controlPlane":{
            "configVersion":10001,
            "rules":{"r1":{"action":2,"match":{"path":"/v1/ping","proportion":1}}},
            "regions":{"eu-west-1":{"id":"eu-west-1","status":"ONLINE",
                "apps":{"default":{"api":"api2.example.com"}}}},
            "hobRegions":{"LON":"eu-west-1"},
            "hobModes":{"LON":"h1","default":"h2"}
        }}"#
        .to_vec()
    }

    fn new_plane(dir: &std::path::Path) -> (Arc<ConfigSource>, Arc<ControlPlane>) {
        let source = Arc::new(ConfigSource::new());
        let shutdown = Arc::new(Shutdown::new());
        let cp = ControlPlane::new(source.clone(), dir.join("last-good"), shutdown);
        (source, cp)
    }

    #[tokio::test]
    async fn test_empty_source_leaves_empty_snapshot() {
        let dir = std::env::temp_dir().join(format!("cp-test-empty-{}", std::process::id()));
        let (_source, cp) = new_plane(&dir);
        assert!(cp.snapshot().rules.is_empty());
        assert_eq!(cp.snapshot().config_version, 0);
    }

    #[tokio::test]
    async fn test_try_load_publishes_sorted_snapshot() {
        let dir = std::env::temp_dir().join(format!("cp-test-load-{}", std::process::id()));
        let (source, cp) = new_plane(&dir);

        source.load(fixture_json()).unwrap();
        cp.try_load().unwrap();

        let snap = cp.snapshot();
        assert_eq!(snap.rules.len(), 1);
        assert_eq!(snap.config_version, 10001);
        assert_eq!(snap.hob_regions.get("LON").unwrap(), "eu-west-1");
        assert!(!snap.config_hash.is_empty());

        // and the last good copy landed on disk
        let persisted = std::fs::read(dir.join("last-good")).unwrap();
        assert_eq!(persisted, fixture_json());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_unchanged_config_is_a_noop() {
        let dir = std::env::temp_dir().join(format!("cp-test-noop-{}", std::process::id()));
        let (source, cp) = new_plane(&dir);

        source.load(fixture_json()).unwrap();
        cp.try_load().unwrap();
        let first = cp.snapshot();

        cp.try_load().unwrap();
        let second = cp.snapshot();
        assert!(Arc::ptr_eq(&first, &second), "identical config must not republish");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_previous_snapshot() {
        let dir = std::env::temp_dir().join(format!("cp-test-invalid-{}", std::process::id()));
        let (source, cp) = new_plane(&dir);

        source.load(fixture_json()).unwrap();
        cp.try_load().unwrap();
        let good = cp.snapshot();

        // no regions: validation must fail and leave the old snapshot
        source
            .load(br#"{"controlPlane":{"rules":{"r1":{"action":2,"match":{"proportion":1}}},"regions":{}}}"#.to_vec())
            .unwrap();
        assert!(cp.try_load().is_err());
        assert!(Arc::ptr_eq(&good, &cp.snapshot()));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
