//! Dynamic configuration document store.
//!
//! # Responsibilities
//! - Hold the raw dynamic configuration bytes and their parsed JSON form
//! - Fan out change notifications to subscribers over a watch channel
//! - Serve typed path lookups for the flat collaborator keys
//!
//! # Design Decisions
//! - Raw bytes and parsed document are published through atomic swaps so
//!   readers never block
//! - A failed parse leaves the previous document in place

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::watch;

/// The live dynamic configuration document.
///
/// Loaded from the external configuration source (and, at startup, from the
/// persisted last-good file). The control plane, PCI filter, host mapper and
/// throttler all read from here.
pub struct ConfigSource {
    raw: ArcSwap<Vec<u8>>,
    parsed: ArcSwap<Value>,
    changes: watch::Sender<u64>,
}

impl ConfigSource {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            raw: ArcSwap::from_pointee(Vec::new()),
            parsed: ArcSwap::from_pointee(Value::Null),
            changes,
        }
    }

    /// Replace the configuration document and notify subscribers.
    ///
    /// The raw bytes are only published if they parse as JSON; on error the
    /// previous document stays in place.
    pub fn load(&self, raw: Vec<u8>) -> Result<(), serde_json::Error> {
        let parsed: Value = serde_json::from_slice(&raw)?;
        self.parsed.store(Arc::new(parsed));
        self.raw.store(Arc::new(raw));
        self.changes.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// The raw bytes of the current document. Empty before the first load.
    pub fn raw(&self) -> Arc<Vec<u8>> {
        self.raw.load_full()
    }

    /// Subscribe to change notifications. The value is a generation counter;
    /// subscribers only care that it changed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Walk a nested path into the document. A single dotted key at the top
    /// level (`"pci.sensitivePaths"`) is accepted as an alternative spelling.
    fn at_path(&self, path: &[&str]) -> Option<Value> {
        let doc = self.parsed.load();
        let mut cur: &Value = &doc;
        for segment in path {
            match cur.get(segment) {
                Some(next) => cur = next,
                None => return doc.get(path.join(".")).cloned(),
            }
        }
        Some(cur.clone())
    }

    pub fn bool_at(&self, path: &[&str], default: bool) -> bool {
        self.at_path(path).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn f64_at(&self, path: &[&str], default: f64) -> f64 {
        self.at_path(path).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn string_at(&self, path: &[&str], default: &str) -> String {
        self.at_path(path)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn string_map_at(&self, path: &[&str]) -> HashMap<String, String> {
        let mut result = HashMap::new();
        if let Some(Value::Object(map)) = self.at_path(path) {
            for (k, v) in map {
                if let Value::String(s) = v {
                    result.insert(k, s);
                }
            }
        }
        result
    }

    pub fn string_list_at(&self, path: &[&str]) -> Vec<String> {
        match self.at_path(path) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Default for ConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_publishes_and_notifies() {
        let source = ConfigSource::new();
        let mut rx = source.subscribe();
        let initial = *rx.borrow();

        source
            .load(br#"{"hailo":{"api":{"sanitiseErrors":true}}}"#.to_vec())
            .unwrap();

        assert!(rx.has_changed().unwrap());
        assert_ne!(*rx.borrow_and_update(), initial);
        assert!(source.bool_at(&["hailo", "api", "sanitiseErrors"], false));
    }

    #[test]
    fn test_bad_json_keeps_previous_document() {
        let source = ConfigSource::new();
        source
            .load(br#"{"api":{"proxyMappings":{"a.com":"b.com"}}}"#.to_vec())
            .unwrap();

        assert!(source.load(b"{not json".to_vec()).is_err());

        let mappings = source.string_map_at(&["api", "proxyMappings"]);
        assert_eq!(mappings.get("a.com").map(String::as_str), Some("b.com"));
    }

    #[test]
    fn test_flat_dotted_key_fallback() {
        let source = ConfigSource::new();
        source
            .load(br#"{"pci.sensitivePaths":["POST /v1/card"]}"#.to_vec())
            .unwrap();

        assert_eq!(
            source.string_list_at(&["pci", "sensitivePaths"]),
            vec!["POST /v1/card".to_string()]
        );
    }

    #[test]
    fn test_defaults_when_absent() {
        let source = ConfigSource::new();
        assert!(!source.bool_at(&["hailo", "api", "sanitiseErrors"], false));
        assert_eq!(source.f64_at(&["hailo", "api", "trace", "pcChance"], 0.0), 0.0);
        assert!(source.string_map_at(&["api", "proxyMappings"]).is_empty());
    }
}
