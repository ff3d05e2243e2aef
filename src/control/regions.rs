//! Region definitions for app pinning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// URLs for named purposes, eg: "hms", "api".
pub type Urls = BTreeMap<String, String>;

/// Config for a single region.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Region {
    /// ID of this region, eg: us-east-1.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// ONLINE or OFFLINE. Not a bool to cope with possible future additions.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Failover regions, tried in order if this one is down.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failover: Vec<String>,
    /// Apps and their URL config for pinning. The app key "default" is the
    /// fallback.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub apps: BTreeMap<String, Urls>,
}

impl Region {
    /// Tells us if this region is configured to accept traffic. Only the
    /// specific word "OFFLINE" takes us offline.
    pub fn is_online(&self) -> bool {
        self.status != "OFFLINE"
    }

    /// URLs for a given app within this region, falling back to "default".
    pub fn urls(&self, app: &str) -> Option<&Urls> {
        self.apps.get(app).or_else(|| self.apps.get("default"))
    }
}

/// Locates the value for a HOB in a HOB-keyed map, falling back to "default"
/// if none found and returning "" if that isn't present either.
pub fn find_for_hob<'a>(map: &'a BTreeMap<String, String>, hob: &str) -> &'a str {
    map.get(hob)
        .or_else(|| map.get("default"))
        .map(String::as_str)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(status: &str) -> Region {
        let mut apps = BTreeMap::new();
        apps.insert(
            "default".to_string(),
            Urls::from([("api".to_string(), "api2.example.com".to_string())]),
        );
        apps.insert(
            "driver".to_string(),
            Urls::from([("api".to_string(), "api-driver.example.com".to_string())]),
        );
        Region {
            id: "eu-west-1".into(),
            status: status.into(),
            failover: vec![],
            apps,
        }
    }

    #[test]
    fn test_only_offline_word_takes_region_offline() {
        assert!(region("ONLINE").is_online());
        assert!(region("").is_online());
        assert!(region("DRAINING").is_online());
        assert!(!region("OFFLINE").is_online());
    }

    #[test]
    fn test_urls_fall_back_to_default_app() {
        let r = region("ONLINE");
        assert_eq!(
            r.urls("driver").unwrap().get("api").unwrap(),
            "api-driver.example.com"
        );
        assert_eq!(
            r.urls("customer").unwrap().get("api").unwrap(),
            "api2.example.com"
        );
        assert!(Region::default().urls("driver").is_none());
    }

    #[test]
    fn test_find_for_hob_falls_back_to_default() {
        let map = BTreeMap::from([
            ("LON".to_string(), "eu-west-1".to_string()),
            ("default".to_string(), "us-east-1".to_string()),
        ]);
        assert_eq!(find_for_hob(&map, "LON"), "eu-west-1");
        assert_eq!(find_for_hob(&map, "ZZZ"), "us-east-1");

        let no_default = BTreeMap::from([("LON".to_string(), "eu-west-1".to_string())]);
        assert_eq!(find_for_hob(&no_default, "ZZZ"), "");
    }
}
