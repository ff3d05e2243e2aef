//! The immutable configuration snapshot.
//!
//! The unit of atomic publication: writers build a complete new snapshot
//! off-path and publish it with a single atomic store; readers take a
//! reference and read without locking. Once published, a snapshot is never
//! mutated.

use std::collections::BTreeMap;

use crate::control::regions::Region;
use crate::control::rules::{fnv64, Rule};

/// One complete, validated generation of routing configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    /// Rules in matching order (weight desc, specificity desc).
    pub rules: Vec<Rule>,
    /// Region definitions, keyed by region ID.
    pub regions: BTreeMap<String, Region>,
    /// HOB to primary region mappings, with optional "default" key.
    pub hob_regions: BTreeMap<String, String>,
    /// HOB to mode mappings, with optional "default" key.
    pub hob_modes: BTreeMap<String, String>,
    /// Region config version, a timestamp.
    pub config_version: i64,
    /// Hash of everything loaded, so we avoid republishing unless changed.
    pub config_hash: String,
}

impl ConfigSnapshot {
    /// Content hash over the loaded configuration. All maps are ordered, so
    /// serialisation (and therefore the hash) is deterministic.
    pub fn content_hash(
        rules: &[Rule],
        regions: &BTreeMap<String, Region>,
        hob_regions: &BTreeMap<String, String>,
        config_version: i64,
        hob_modes: &BTreeMap<String, String>,
    ) -> String {
        let bytes =
            serde_json::to_vec(&(rules, regions, hob_regions, config_version, hob_modes))
                .unwrap_or_default();
        format!("{:x}", fnv64(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::rules::{Action, Match};

    fn fixture() -> (Vec<Rule>, BTreeMap<String, Region>) {
        let rules = vec![Rule {
            matcher: Some(Match {
                path: "/v1/point".into(),
                proportion: 0.6,
                ..Default::default()
            }),
            action: Action::SendToH2,
            payload: None,
            weight: 0,
        }];
        let mut regions = BTreeMap::new();
        regions.insert(
            "eu-west-1".to_string(),
            Region {
                id: "eu-west-1".into(),
                status: "ONLINE".into(),
                ..Default::default()
            },
        );
        (rules, regions)
    }

    #[test]
    fn test_hash_is_deterministic() {
        let (rules, regions) = fixture();
        let empty = BTreeMap::new();
        let a = ConfigSnapshot::content_hash(&rules, &regions, &empty, 10001, &empty);
        let b = ConfigSnapshot::content_hash(&rules, &regions, &empty, 10001, &empty);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let (rules, regions) = fixture();
        let empty = BTreeMap::new();
        let a = ConfigSnapshot::content_hash(&rules, &regions, &empty, 10001, &empty);
        let b = ConfigSnapshot::content_hash(&rules, &regions, &empty, 10002, &empty);
        assert_ne!(a, b);

        let c = ConfigSnapshot::content_hash(&[], &regions, &empty, 10001, &empty);
        assert_ne!(a, c);
    }
}
