//! Per-request routing over the current config snapshot.

use std::sync::Arc;

use crate::control::extractor::{Extractor, Features};
use crate::control::regions::{find_for_hob, Region, Urls};
use crate::control::rules::{Action, Rule};
use crate::control::ControlPlane;

/// The thin API is referenced by this name (eg: rather than "hms").
const URL_NAME: &str = "api";

/// Result of checking the request hostname against the active region.
#[derive(Debug)]
pub struct HostnameCheck {
    /// Whether the request already targets the expected hostname.
    pub is_correct: bool,
    /// The expected URLs for this request's app.
    pub urls: Urls,
    /// Config version, attached to pinning headers as a timestamp.
    pub version: i64,
}

/// Why a hostname check could not be performed.
#[derive(Debug, thiserror::Error)]
pub enum PinningError {
    #[error("No HOB available, unable to check region pinning")]
    NoHob,
    #[error("No Region available, unable to check region pinning")]
    NoRegion,
}

/// Routes a request to a backend (H1, H2, throttle or deprecate) according
/// to the first matching rule, and resolves the region the request should be
/// directed to.
pub struct RuleRouter {
    control: Arc<ControlPlane>,
    extractor: Extractor,
}

impl RuleRouter {
    pub fn new(control: Arc<ControlPlane>, extractor: Extractor) -> Self {
        Self { control, extractor }
    }

    pub fn set_hob(&mut self, hob: &str) {
        self.extractor.set_hob(hob);
    }

    pub fn extractor(&mut self) -> &mut Extractor {
        &mut self.extractor
    }

    /// Select the rule for this request: a forced route if the client sent
    /// one, else the first matching rule in specificity order. `None` means
    /// the caller should apply its default.
    pub fn route(&mut self) -> Option<Rule> {
        let route_str = self.extractor.header("X-Hailo-Route");
        if !route_str.is_empty() {
            if let Some(rule) = force_route(&route_str) {
                return Some(rule);
            }
        }

        let snapshot = self.control.snapshot();
        for rule in &snapshot.rules {
            if rule.matches(&mut self.extractor) {
                return Some(rule.clone());
            }
        }

        None
    }

    /// The mode for this request's HOB, overridden by a forced route.
    pub fn hob_mode(&mut self) -> String {
        let route_str = self.extractor.header("X-Hailo-Route");
        match route_str.as_str() {
            // for forced routes, report what they're forcing to
            "H1" => return "h1".to_string(),
            "H2" => return "h2".to_string(),
            _ => {}
        }
        let snapshot = self.control.snapshot();
        let hob = self.extractor.hob();
        find_for_hob(&snapshot.hob_modes, &hob).to_string()
    }

    /// Identify the region that API requests for this HTTP request should be
    /// sent to, plus the config version.
    pub fn region(&mut self) -> (Option<Region>, i64) {
        let snapshot = self.control.snapshot();
        let hob = self.extractor.hob();
        let region_id = find_for_hob(&snapshot.hob_regions, &hob);
        let mut region = snapshot.regions.get(region_id);

        // None found? Use the fallback region: the first one lexicographically
        // by region ID, so the default is stable across reloads.
        if region.is_none() {
            if let Some((id, fallback)) = snapshot.regions.iter().next() {
                tracing::debug!(region = %id, "Unable to detect region from HOB, picking default region");
                region = Some(fallback);
            }
        }

        let Some(region) = region else {
            return (None, snapshot.config_version);
        };

        if region.is_online() {
            return (Some(region.clone()), snapshot.config_version);
        }

        // Try failovers
        for fo_id in &region.failover {
            if let Some(fo) = snapshot.regions.get(fo_id) {
                if fo.is_online() {
                    return (Some(fo.clone()), snapshot.config_version);
                }
            }
        }

        // Return anyway, even though the region is offline (better than nothing)
        (Some(region.clone()), snapshot.config_version)
    }

    /// Tests if the request hostname matches the expected hostname for the
    /// active region, returning the right one if not.
    ///
    /// `response_hob` is a HOB already decided on the response (eg: by the H2
    /// backend), used when the request itself carries none. With no HOB at
    /// all the check is skipped entirely: picking some default region here
    /// would pin clients to the wrong region. This bit drivers before login,
    /// where the city is only known afterwards.
    pub fn correct_hostname(
        &mut self,
        response_hob: Option<&str>,
    ) -> Result<HostnameCheck, PinningError> {
        let mut hob = self.extractor.hob();
        if hob.is_empty() {
            hob = response_hob.unwrap_or("").to_string();
        }
        if hob.is_empty() {
            return Err(PinningError::NoHob);
        }

        let (region, version) = self.region();
        let Some(region) = region else {
            return Err(PinningError::NoRegion);
        };

        let source = self.extractor.source();
        let urls = region.urls(&source).cloned().unwrap_or_default();

        let host = self.extractor.host();
        let is_correct = urls.get(URL_NAME).is_some_and(|expected| expected == &host);

        Ok(HostnameCheck {
            is_correct,
            urls,
            version,
        })
    }
}

fn force_route(route_str: &str) -> Option<Rule> {
    match route_str.to_uppercase().as_str() {
        "H2" => Some(Rule::for_action(Action::SendToH2)),
        "H1" => Some(Rule::for_action(Action::ProxyToH1)),
        "DEPRECATE" => Some(Rule::for_action(Action::Deprecate)),
        "THROTTLE" => Some(Rule::for_action(Action::Throttle)),
        _ => None,
    }
}
